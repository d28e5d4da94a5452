use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::data::dataset::DrLevel;
use crate::error::{Error, Result};

/// One row of an annotation CSV. Columns other than these are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnnotationRow {
    pub img_path: String,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default, rename = "patient_DR_Level")]
    pub dr_level: Option<f64>,
}

/// Reads every row of an annotation table in file order.
pub fn read_annotations(path: impl AsRef<Path>) -> Result<Vec<AnnotationRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

impl AnnotationRow {
    /// The row's DR level; `row` is the 1-based data row for error messages.
    pub fn level(&self, row: usize) -> Result<DrLevel> {
        let raw = self.dr_level.ok_or_else(|| Error::Annotation {
            row,
            message: "missing patient_DR_Level".to_string(),
        })?;
        if raw.fract() != 0.0 {
            return Err(Error::Annotation { row, message: format!("non-integer DR level {}", raw) });
        }
        DrLevel::try_from(raw as i64)
    }

    /// `(patient, eye)` grouping key: the `image_id` part before the first
    /// `_`, and the first character of the part after it.
    pub fn eye_key(&self, row: usize) -> Result<(String, String)> {
        let id = self.image_id.as_deref().ok_or_else(|| Error::Annotation {
            row,
            message: "dual mode needs an image_id column".to_string(),
        })?;
        let mut parts = id.split('_');
        let patient = parts.next().unwrap_or_default().to_string();
        let eye = parts
            .next()
            .and_then(|s| s.chars().next())
            .ok_or_else(|| Error::Annotation {
                row,
                message: format!("image_id '{}' has no eye suffix", id),
            })?;
        Ok((patient, eye.to_string()))
    }
}

/// Groups rows by `(patient, eye)`, ordered by key. Each group keeps the
/// indices of its rows in file order.
pub fn group_by_eye(rows: &[AnnotationRow]) -> Result<BTreeMap<(String, String), Vec<usize>>> {
    let mut groups: BTreeMap<(String, String), Vec<usize>> = BTreeMap::new();
    for (i, row) in rows.iter().enumerate() {
        groups.entry(row.eye_key(i + 1)?).or_default().push(i);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_reads_rows_with_extra_columns() {
        let file = write_csv("img_path,image_id,patient_DR_Level,site\na.jpg,1_l1,2,x\nb.jpg,1_l2,2.0,y\n");
        let rows = read_annotations(file.path()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].img_path, "b.jpg");
        assert_eq!(rows[1].level(2).unwrap(), DrLevel::Moderate);
    }

    #[test]
    fn test_label_column_is_optional() {
        let file = write_csv("img_path\na.jpg\n");
        let rows = read_annotations(file.path()).unwrap();
        assert_eq!(rows[0].dr_level, None);
        assert!(matches!(rows[0].level(1), Err(Error::Annotation { row: 1, .. })));
    }

    #[test]
    fn test_out_of_range_level() {
        let row = AnnotationRow { img_path: "a".into(), image_id: None, dr_level: Some(7.0) };
        assert!(matches!(row.level(1), Err(Error::InvalidLabel(7))));
    }

    #[test]
    fn test_groups_are_sorted_by_patient_then_eye() {
        let row = |id: &str| AnnotationRow { img_path: format!("{}.jpg", id), image_id: Some(id.into()), dr_level: Some(0.0) };
        let rows = vec![row("2_r1"), row("10_l1"), row("2_l1"), row("2_r2"), row("2_l2")];
        let groups = group_by_eye(&rows).unwrap();
        let keys: Vec<_> = groups.keys().cloned().collect();
        assert_eq!(keys, vec![
            ("10".to_string(), "l".to_string()),
            ("2".to_string(), "l".to_string()),
            ("2".to_string(), "r".to_string()),
        ]);
        assert_eq!(groups[&("2".to_string(), "r".to_string())], vec![0, 3]);
    }

    #[test]
    fn test_id_without_suffix_is_rejected() {
        let row = AnnotationRow { img_path: "a".into(), image_id: Some("123".into()), dr_level: None };
        assert!(matches!(row.eye_key(4), Err(Error::Annotation { row: 4, .. })));
    }
}

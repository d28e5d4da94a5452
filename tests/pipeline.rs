use std::path::Path;

use fundus_grade::config::{DataPaths, TrainingSettings};
use fundus_grade::ensemble::BoostingParams;
use fundus_grade::{predict_with_ensemble, run_pipeline, BoostingEnsemble, ModelConfig, PairingMode, PipelineConfig};

/// Writes `rows` as `{patient}_{eye}{n}.png` images plus an annotation CSV.
fn write_split(dir: &Path, name: &str, rows: &[(&str, u8)], labelled: bool) {
    let images = dir.join(name);
    std::fs::create_dir_all(&images).unwrap();
    let mut csv = String::from(if labelled { "img_path,image_id,patient_DR_Level\n" } else { "img_path,image_id\n" });
    for (i, (id, level)) in rows.iter().enumerate() {
        let file = format!("{}.png", id);
        let shade = 40 * *level + 5 * i as u8;
        let img = image::RgbImage::from_fn(24, 20, |x, y| {
            image::Rgb([shade, (x * 10) as u8, (y * 12) as u8])
        });
        img.save(images.join(&file)).unwrap();
        if labelled {
            csv.push_str(&format!("{},{},{}\n", file, id, level));
        } else {
            csv.push_str(&format!("{},{}\n", file, id));
        }
    }
    std::fs::write(dir.join(format!("{}.csv", name)), csv).unwrap();
}

fn config(root: &Path, mode: PairingMode) -> PipelineConfig {
    PipelineConfig {
        data: DataPaths {
            train_csv: root.join("train.csv"),
            train_dir: root.join("train"),
            val_csv: root.join("val.csv"),
            val_dir: root.join("val"),
            test_csv: Some(root.join("test.csv")),
            test_dir: root.join("test"),
        },
        mode,
        model: ModelConfig::compact(16),
        resize: 20,
        crop: 14,
        members: 2,
        training: TrainingSettings { epochs: 1, batch_size: 4, ..Default::default() },
        boosting: BoostingParams { n_estimators: 5, ..Default::default() },
        output_dir: root.join("out"),
        visualize_count: 2,
        ..Default::default()
    }
}

fn write_dataset(root: &Path) {
    let train = [
        ("001_l1", 0), ("001_l2", 0), ("002_r1", 1), ("002_r2", 1),
        ("003_l1", 2), ("003_l2", 2), ("004_r1", 0), ("004_r2", 0),
    ];
    let val = [("005_l1", 0), ("005_l2", 0), ("006_r1", 2), ("006_r2", 2)];
    let test = [("007_l1", 0), ("007_l2", 0), ("008_r1", 0)];
    write_split(root, "train", &train, true);
    write_split(root, "val", &val, true);
    write_split(root, "test", &test, false);
}

#[test]
fn single_mode_pipeline_writes_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let config = config(dir.path(), PairingMode::Single);

    let report = run_pipeline(&config).unwrap();
    let out = dir.path().join("out");

    assert_eq!(report.outcomes.len(), 2);
    assert!(out.join("members/member_0.json").exists());
    assert!(out.join("members/member_1.json").exists());
    assert!(out.join("visualizations/training_history.json").exists());
    assert!(out.join("visualizations/gradcam_visualization_0.png").exists());
    assert!(out.join("visualizations/gradcam_visualization_1.png").exists());
    assert_eq!(report.visualizations.len(), 3);
    assert!((0.0..=1.0).contains(&report.validation.accuracy));

    let csv = std::fs::read_to_string(out.join("test_predictions.csv")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "ID,TARGET");
    assert_eq!(lines.len(), 4);
    assert!(lines[1].starts_with("007_l1.png,"));

    let ensemble = BoostingEnsemble::load_json(&report.ensemble_path).unwrap();
    assert_eq!(ensemble.members.len(), 2);
    assert!(ensemble.booster.is_fitted());

    let rerun = dir.path().join("again.csv");
    let rows = predict_with_ensemble(&report.ensemble_path, dir.path().join("test.csv"), dir.path().join("test"), &rerun).unwrap();
    assert_eq!(rows, 3);
    assert_eq!(std::fs::read_to_string(rerun).unwrap(), csv);
}

#[test]
fn dual_mode_pipeline_predicts_both_images_of_a_pair() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path());
    let mut config = config(dir.path(), PairingMode::Dual);
    config.members = 1;
    config.meta_features = fundus_grade::MetaFeatures::Logits;

    let report = run_pipeline(&config).unwrap();
    let csv = std::fs::read_to_string(report.predictions_path.unwrap()).unwrap();
    let ids: Vec<&str> = csv.lines().skip(1).map(|l| l.split(',').next().unwrap()).collect();
    // Patient 008 has a single image and is skipped.
    assert_eq!(ids, vec!["007_l1.png", "007_l2.png"]);
}

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use flate2::Compression;
use flate2::write::GzEncoder;
use ndarray::{Array2, ArrayView2};
use tempfile::{TempDir, tempdir};

use wavepca::pipeline::ReduceError;
use wavepca::source::DenseChunkSource;
use wavepca::{
    Algorithm, IncrementalArtifact, IncrementalScaler, MissingPolicy, OutputLayout, ReduceConfig,
    TableOptions, TsvChunkSource, reduce, transform,
};

const ROWS: usize = 24;
const FEATURES: usize = 6;

fn value(i: usize, j: usize) -> f64 {
    let phase = (i * (j + 1)) as f64 * 0.731 + j as f64;
    phase.sin() * (j + 1) as f64 + 0.05 * (i as f64) * (j as f64 - 2.5)
}

fn matrix() -> Array2<f64> {
    Array2::from_shape_fn((ROWS, FEATURES), |(i, j)| value(i, j))
}

/// Wavelet-style table: an id column, an unrelated covariate between feature columns,
/// and `FEATURES` columns whose names contain `lead`.
fn table_text(extra_rows: &[&str]) -> String {
    let mut text = String::from("24983_id\tlead1_c0\tlead1_c1\tlead1_c2\tage\tlead2_c0\tlead2_c1\tlead2_c2\n");
    for i in 0..ROWS {
        let cells: Vec<String> = (0..FEATURES).map(|j| format!("{}", value(i, j))).collect();
        text.push_str(&format!(
            "S{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            i + 1,
            cells[0],
            cells[1],
            cells[2],
            40 + i,
            cells[3],
            cells[4],
            cells[5]
        ));
    }
    for row in extra_rows {
        text.push_str(row);
        text.push('\n');
    }
    text
}

fn write_table(dir: &TempDir, name: &str, text: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, text).expect("write table");
    path
}

fn lead_options(missing: MissingPolicy) -> TableOptions {
    TableOptions {
        id_column: Some("24983_id".into()),
        feature_filter: Some("lead".into()),
        missing,
    }
}

fn base_config() -> ReduceConfig {
    ReduceConfig {
        chunk_size: 5,
        components: 3,
        oversampling: 3,
        ..ReduceConfig::default()
    }
}

fn max_abs_diff(a: ArrayView2<'_, f64>, b: ArrayView2<'_, f64>) -> f64 {
    assert_eq!(a.dim(), b.dim());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

fn read_rows(path: &Path) -> Vec<Vec<String>> {
    fs::read_to_string(path)
        .expect("read output")
        .lines()
        .map(|line| line.split('\t').map(str::to_string).collect())
        .collect()
}

#[test]
fn tsv_and_dense_sources_agree() {
    let dir = tempdir().expect("temporary directory");
    let path = write_table(&dir, "features.tsv", &table_text(&[]));
    let config = base_config();

    let mut tsv = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open table");
    let from_tsv = reduce(&mut tsv, &config).expect("tsv reduction");

    let data = matrix();
    let mut dense = DenseChunkSource::from_matrix(&data).expect("dense source");
    let from_dense = reduce(&mut dense, &config).expect("dense reduction");

    assert_eq!(
        from_tsv.feature_names,
        ["lead1_c0", "lead1_c1", "lead1_c2", "lead2_c0", "lead2_c1", "lead2_c2"]
    );
    assert_eq!(from_tsv.embedding.ids(), from_dense.embedding.ids());
    assert!(max_abs_diff(from_tsv.embedding.values(), from_dense.embedding.values()) < 1e-10);
    assert!(from_tsv.report.is_clean());
}

#[test]
fn gzip_input_matches_plain_input() {
    let dir = tempdir().expect("temporary directory");
    let text = table_text(&[]);
    let plain = write_table(&dir, "features.tsv", &text);
    let gz = dir.path().join("features.tsv.gz");
    let mut encoder = GzEncoder::new(fs::File::create(&gz).expect("create gz"), Compression::default());
    encoder.write_all(text.as_bytes()).expect("compress");
    encoder.finish().expect("finish gz");

    let config = base_config();
    let mut plain_source = TsvChunkSource::open(&plain, lead_options(MissingPolicy::Fail)).expect("open");
    let mut gz_source = TsvChunkSource::open(&gz, lead_options(MissingPolicy::Fail)).expect("open gz");
    let a = reduce(&mut plain_source, &config).expect("plain");
    let b = reduce(&mut gz_source, &config).expect("gz");
    assert_eq!(a.embedding.ids(), b.embedding.ids());
    assert_eq!(a.embedding.values(), b.embedding.values());
}

#[test]
fn exclude_policy_skips_rejected_rows_once() {
    let dir = tempdir().expect("temporary directory");
    let extra = [
        "short\t1.0\t2.0",
        "\t1\t2\t3\t50\t4\t5\t6",
        "all_missing\tNA\t.\t\t51\tNaN\tnull\tNA",
        "partial\tNA\t0.5\tabc\t52\t1.5\t-0.25\t2",
    ];
    let path = write_table(&dir, "ragged.tsv", &table_text(&extra));

    for algorithm in [Algorithm::Randomized, Algorithm::Incremental] {
        let config = ReduceConfig {
            algorithm,
            missing: MissingPolicy::Exclude,
            incremental_scaler: IncrementalScaler::FullPass,
            ..base_config()
        };
        let mut source = TsvChunkSource::open(&path, lead_options(MissingPolicy::Exclude)).expect("open");
        let outcome = reduce(&mut source, &config).expect("reduction");

        let embedding = &outcome.embedding;
        assert_eq!(embedding.n_rows(), ROWS + 1);
        let unique: HashSet<&String> = embedding.ids().iter().collect();
        assert_eq!(unique.len(), embedding.n_rows());
        assert_eq!(embedding.ids().last().map(String::as_str), Some("partial"));
        assert!(embedding.values().iter().all(|v| v.is_finite()));

        assert_eq!(outcome.report.rows_read, (ROWS + extra.len()) as u64);
        assert_eq!(outcome.report.rows_rejected, 3);
        assert_eq!(outcome.report.invalid_cells, 1);
    }

    let mut strict = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open");
    let err = reduce(&mut strict, &base_config()).expect_err("malformed row must fail");
    assert!(matches!(err, ReduceError::Source(_)), "unexpected error: {err}");
}

#[test]
fn saved_incremental_model_reproduces_the_embedding() {
    let dir = tempdir().expect("temporary directory");
    let path = write_table(&dir, "features.tsv", &table_text(&[]));
    let config = ReduceConfig {
        algorithm: Algorithm::Incremental,
        chunk_size: 100,
        ..base_config()
    };

    let mut source = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open");
    let outcome = reduce(&mut source, &config).expect("incremental reduction");
    assert_eq!(outcome.passes, 1);

    let model_path = dir.path().join("model.toml");
    outcome.artifact().expect("incremental artifact").save(&model_path).expect("save model");
    let artifact = IncrementalArtifact::load(&model_path).expect("load model");

    let mut again = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open");
    let embedding = transform(&mut again, &artifact, 7).expect("transform");
    assert_eq!(embedding.ids(), outcome.embedding.ids());
    assert!(max_abs_diff(embedding.values(), outcome.embedding.values()) < 1e-9);
}

#[test]
fn bootstrap_with_single_row_chunks_matches_component_sized_chunks() {
    let dir = tempdir().expect("temporary directory");
    let path = write_table(&dir, "features.tsv", &table_text(&[]));
    let run = |chunk_size: usize| {
        let config = ReduceConfig {
            algorithm: Algorithm::Incremental,
            chunk_size,
            ..base_config()
        };
        let mut source = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open");
        reduce(&mut source, &config).expect("incremental reduction")
    };

    let single = run(1);
    let batched = run(3);
    assert_eq!(single.embedding.n_rows(), ROWS);
    assert_eq!(single.embedding.ids(), batched.embedding.ids());
    assert!(single.standardizer.zero_filled_features().is_empty());
    assert!(single.embedding.values().iter().any(|v| v.abs() > 1e-6));
    assert!(max_abs_diff(single.embedding.values(), batched.embedding.values()) < 1e-12);
}

#[test]
fn embedding_layouts() {
    let dir = tempdir().expect("temporary directory");
    let path = write_table(&dir, "features.tsv", &table_text(&[]));
    let mut source = TsvChunkSource::open(&path, lead_options(MissingPolicy::Fail)).expect("open");
    let outcome = reduce(&mut source, &base_config()).expect("reduction");

    let plink = dir.path().join("plink.tsv");
    outcome.embedding.write_tsv(&plink, OutputLayout::Plink).expect("write plink");
    let rows = read_rows(&plink);
    assert_eq!(rows[0], ["#FID", "IID", "PC1", "PC2", "PC3"]);
    assert_eq!(rows.len(), ROWS + 1);
    assert_eq!(rows[1][0], "S1");
    assert_eq!(rows[1][1], "S1");

    let plain = dir.path().join("plain.tsv");
    outcome.embedding.write_tsv(&plain, OutputLayout::Plain).expect("write plain");
    let rows = read_rows(&plain);
    assert_eq!(rows[0], ["24983_id", "PC1", "PC2", "PC3"]);
    for (i, row) in rows.iter().skip(1).enumerate() {
        assert_eq!(row[0], format!("S{}", i + 1));
        for (j, cell) in row.iter().skip(1).enumerate() {
            let parsed: f64 = cell.parse().expect("numeric cell");
            assert_eq!(parsed, outcome.embedding.values()[[i, j]]);
        }
    }
}

#[test]
fn cli_reduce_and_transform() {
    let dir = tempdir().expect("temporary directory");
    let input = write_table(&dir, "features.tsv", &table_text(&[]));
    let embedding = dir.path().join("embedding.tsv");
    let model = dir.path().join("model.toml");
    let factors = dir.path().join("factors");
    let exe = env!("CARGO_BIN_EXE_wavepca");

    let status = Command::new(exe)
        .args([
            "reduce",
            input.to_str().expect("utf-8 path"),
            "-o",
            embedding.to_str().expect("utf-8 path"),
            "-k",
            "2",
            "--oversampling",
            "4",
            "--chunk-size",
            "6",
            "--id-column",
            "24983_id",
            "--feature-filter",
            "lead",
            "--factors-dir",
            factors.to_str().expect("utf-8 path"),
        ])
        .status()
        .expect("run reduce");
    assert!(status.success());
    assert_eq!(read_rows(&embedding)[0], ["#FID", "IID", "PC1", "PC2"]);
    assert_eq!(read_rows(&embedding).len(), ROWS + 1);
    for name in ["U.tsv", "S.tsv", "Vt.tsv"] {
        assert!(factors.join(name).exists(), "{name} missing");
    }
    let u = read_rows(&factors.join("U.tsv"));
    assert_eq!(u[0], ["0", "1", "2", "3", "4", "5"]);
    assert_eq!(u.len(), ROWS + 1);
    assert_eq!(read_rows(&factors.join("S.tsv")).len(), 2 + 4 + 1);
    assert_eq!(read_rows(&factors.join("Vt.tsv"))[1].len(), FEATURES);

    let incremental = dir.path().join("incremental.tsv");
    let status = Command::new(exe)
        .args([
            "reduce",
            input.to_str().expect("utf-8 path"),
            "-o",
            incremental.to_str().expect("utf-8 path"),
            "-k",
            "2",
            "--algorithm",
            "incremental",
            "--chunk-size",
            "100",
            "--feature-filter",
            "lead",
            "--layout",
            "plain",
            "--model-out",
            model.to_str().expect("utf-8 path"),
        ])
        .status()
        .expect("run incremental reduce");
    assert!(status.success());
    assert!(model.exists());

    let transformed = dir.path().join("transformed.tsv");
    let status = Command::new(exe)
        .args([
            "transform",
            input.to_str().expect("utf-8 path"),
            "--model",
            model.to_str().expect("utf-8 path"),
            "-o",
            transformed.to_str().expect("utf-8 path"),
            "--feature-filter",
            "lead",
            "--layout",
            "plain",
        ])
        .status()
        .expect("run transform");
    assert!(status.success());

    let fitted = read_rows(&incremental);
    let replayed = read_rows(&transformed);
    assert_eq!(fitted.len(), replayed.len());
    assert_eq!(fitted[0], replayed[0]);
    for (a, b) in fitted.iter().zip(replayed.iter()).skip(1) {
        assert_eq!(a[0], b[0]);
        for (x, y) in a.iter().zip(b.iter()).skip(1) {
            let x: f64 = x.parse().expect("numeric");
            let y: f64 = y.parse().expect("numeric");
            assert!((x - y).abs() < 1e-9, "{x} vs {y}");
        }
    }
}

#[test]
fn cli_reports_errors_with_nonzero_exit() {
    let dir = tempdir().expect("temporary directory");
    let input = write_table(&dir, "features.tsv", "24983_id\tlead1_a\nS1\t1\nS1\t2\n");
    let output = dir.path().join("out.tsv");

    let result = Command::new(env!("CARGO_BIN_EXE_wavepca"))
        .args([
            "reduce",
            input.to_str().expect("utf-8 path"),
            "-o",
            output.to_str().expect("utf-8 path"),
            "-k",
            "1",
        ])
        .output()
        .expect("run reduce");
    assert!(!result.status.success());
    let stderr = String::from_utf8_lossy(&result.stderr);
    assert!(stderr.contains("Error:"), "stderr: {stderr}");
    assert!(!output.exists());
}

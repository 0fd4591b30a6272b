//! Runs the engine fixture under the protocol driver on the local host.

use std::{fs, path::Path, sync::Arc, time::Duration};

use harness_core::{
    Role,
    distance::cosine_distance,
    input::{batch_input_path, format_pairs, format_vector, parse_vector},
    report::{REPORT_SCHEMA_V1, parse_report},
    share::{BitWidth, create_shares},
};
use harness_runner::{
    ProtocolDriver, RoleCommand, RunSummary, Runner, RunnerConfig,
    config::{HostConfig, TransportKind},
    engine::EngineInvocation,
    recorder::TrialRecorder,
    subjects::Dataset,
    transport::{LocalTransport, Transport},
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

const ENGINE: &str = env!("CARGO_BIN_EXE_pffrocd-engine-fixture");

fn commands(dir: &Path, port: u16, batch: Option<usize>, width: BitWidth) -> [RoleCommand; 2] {
    let transport: Arc<dyn Transport> = Arc::new(LocalTransport);
    Role::ALL.map(|role| {
        let input = match batch {
            Some(_) => dir.join("embeddings"),
            None => dir.join("embeddings.txt"),
        };
        let invocation = EngineInvocation::builder()
            .role(role)
            .working_dir(dir)
            .executable(ENGINE)
            .server_address("127.0.0.1")
            .port(port)
            .input(input)
            .share(dir.join(format!("share{}.txt", role.id())))
            .bit_width(width)
            .output_dir(dir)
            .security_level(128)
            .mt_algorithm(0)
            .maybe_batch(batch)
            .build();

        RoleCommand {
            role,
            transport: transport.clone(),
            command: invocation.command_line(),
        }
    })
}

fn write_shares(dir: &Path, reference: &[f64], width: BitWidth) {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let shares = create_shares(reference, width, &mut rng).unwrap();
    fs::write(dir.join("share0.txt"), shares.share0.to_text()).unwrap();
    fs::write(dir.join("share1.txt"), shares.share1.to_text()).unwrap();
}

#[tokio::test]
async fn test_secure_distance_matches_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let x = vec![0.1; 128];
    let y = vec![0.2; 128];

    write_shares(dir.path(), &y, BitWidth::Double);
    fs::write(dir.path().join("embeddings.txt"), format_pairs(&x, &y).unwrap()).unwrap();

    let [server, client] = commands(dir.path(), 17761, None, BitWidth::Double);
    let output = ProtocolDriver::new(Duration::from_secs(30))
        .run(&server, &client)
        .await
        .unwrap();

    assert!(output.client.success(), "{}", output.client.stderr);
    let metrics = parse_report(output.report().unwrap()).unwrap();
    let expected = cosine_distance(&x, &y).unwrap();

    assert!((metrics.cos_dist_sfe().unwrap() - expected).abs() < 1e-6);
    assert!((metrics.cos_dist_ver().unwrap() - expected).abs() < 1e-6);
}

#[tokio::test]
async fn test_batched_reports_follow_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let reference: Vec<f64> = (0..16).map(|i| 1.0 + i as f64).collect();
    let probes: Vec<Vec<f64>> = vec![
        reference.clone(),
        reference.iter().rev().copied().collect(),
        (0..16).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect(),
    ];

    write_shares(dir.path(), &reference, BitWidth::Double);
    for (idx, probe) in probes.iter().enumerate() {
        let path = batch_input_path(&dir.path().join("embeddings"), idx);
        fs::write(path, format_pairs(probe, &reference).unwrap()).unwrap();
    }

    let [server, client] = commands(dir.path(), 17762, Some(probes.len()), BitWidth::Double);
    let output = ProtocolDriver::new(Duration::from_secs(30))
        .run(&server, &client)
        .await
        .unwrap();

    let records = REPORT_SCHEMA_V1.parse_batch(output.report().unwrap());
    assert_eq!(records.len(), probes.len());
    for (record, probe) in records.iter().zip(&probes) {
        let expected = cosine_distance(probe, &reference).unwrap();
        assert!((record.cos_dist_sfe().unwrap() - expected).abs() < 1e-6);
    }
}

const ALICE: [f64; 4] = [1.0, 0.5, 0.25, 0.125];
const BOB: [f64; 4] = [-0.5, 1.0, 0.75, -0.25];
const PEOPLE: &[(&str, &[f64], usize)] = &[("Alice", &ALICE, 3), ("Bob", &BOB, 2)];

/// Writes `count` embedding files per person, each offset from `base`. The
/// extractor in [`runner_config`] copies them verbatim.
fn write_dataset(images: &Path, people: &[(&str, &[f64], usize)]) {
    for (name, base, count) in people {
        let person = images.join(name);
        fs::create_dir_all(&person).unwrap();
        for idx in 0..*count {
            let embedding: Vec<f64> = base.iter().map(|v| v + idx as f64 * 0.01).collect();
            fs::write(
                person.join(format!("{name}_{idx:04}.jpg")),
                format_vector(&embedding),
            )
            .unwrap();
        }
    }
}

fn runner_config(root: &Path, engine: &str, port: u16) -> RunnerConfig {
    let work = root.join("work");
    let host = |dir: &str| {
        let executable_dir = work.join(dir);
        fs::create_dir_all(&executable_dir).unwrap();
        HostConfig {
            transport: TransportKind::Local,
            executable_dir,
            executable_name: engine.to_string(),
            circuit_dir: work.clone(),
            project_dir: work.clone(),
            ..RunnerConfig::default().server
        }
    };

    let mut config = RunnerConfig {
        server: host("server"),
        client: host("client"),
        ..Default::default()
    };
    config.protocol.port = port;
    config.protocol.timeout = 30;
    config.run.nr_of_people = 2;
    config.run.seed = Some(1);
    config.extractor.command = "cp {image} {output}".to_string();
    config.extractor.image_root = root.join("lfw");
    config.extractor.output = work.join("embedding.txt");
    config
}

/// Writes an executable shell script and returns its path.
fn write_script(dir: &Path, name: &str, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.display().to_string()
}

async fn run(root: &Path, config: RunnerConfig) -> (RunSummary, csv::Reader<fs::File>) {
    let output = root.join("dfs").join("run.csv");
    let dataset = Dataset::open(&root.join("lfw")).unwrap();
    let mut runner = Runner::new(config, &output).unwrap();
    let summary = runner.run(&dataset).await.unwrap();
    assert_eq!(runner.recorder().rows(), summary.succeeded);

    (summary, csv::Reader::from_path(&output).unwrap())
}

/// Checks that every row's secure distance is the plaintext distance of its
/// own image pair, and returns the number of rows.
fn check_rows(images: &Path, mut reader: csv::Reader<fs::File>) -> usize {
    let headers = reader.headers().unwrap().clone();
    let column = |name: &str| headers.iter().position(|h| h == name).unwrap();
    let (ref_img, img, sfe) = (column("ref_img"), column("img"), column("cos_dist_sfe"));

    let mut rows = 0;
    for record in reader.records() {
        let record = record.unwrap();
        let embedding = |col: usize| {
            parse_vector(&fs::read_to_string(images.join(&record[col])).unwrap()).unwrap()
        };
        let expected = cosine_distance(&embedding(img), &embedding(ref_img)).unwrap();
        let actual: f64 = record[sfe].parse().unwrap();

        assert!(
            (actual - expected).abs() < 1e-9,
            "{} against {}: {actual} != {expected}",
            &record[img],
            &record[ref_img]
        );
        rows += 1;
    }
    rows
}

#[tokio::test]
async fn test_runner_records_every_trial() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);

    let config = runner_config(root.path(), ENGINE, 17763);

    let (summary, reader) = run(root.path(), config).await;

    // Alice: two own probes and two of Bob. Bob: one own probe and one of Alice.
    assert_eq!(summary.subjects, 2);
    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(check_rows(&root.path().join("lfw"), reader), 6);
}

#[tokio::test]
async fn test_batched_rows_match_their_images() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);
    let mut config = runner_config(root.path(), ENGINE, 17764);
    config.protocol.batch_size = 3;

    let (summary, reader) = run(root.path(), config).await;

    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(check_rows(&root.path().join("lfw"), reader), 6);
}

#[tokio::test]
async fn test_blank_batch_segment_fails_only_its_probe() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);
    let engine = write_script(
        root.path(),
        "engine.sh",
        &format!("exec '{ENGINE}' --blank-segment 1 \"$@\""),
    );
    let mut config = runner_config(root.path(), &engine, 17765);
    config.protocol.batch_size = 3;

    let (summary, reader) = run(root.path(), config).await;

    // Alice runs batches of 3 and 1: only the middle probe of the first fails.
    // Bob's batch of 2 ends in the blank segment, which leaves one report for
    // two probes, so both fail.
    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.parse_failed, 3);
    assert_eq!(check_rows(&root.path().join("lfw"), reader), 3);
}

#[tokio::test]
async fn test_segment_count_mismatch_fails_whole_batch() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);
    let engine = write_script(
        root.path(),
        "engine.sh",
        &format!("exec '{ENGINE}' --blank-segment 1 \"$@\""),
    );
    let mut config = runner_config(root.path(), &engine, 17766);
    config.protocol.batch_size = 2;

    let (summary, reader) = run(root.path(), config).await;

    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.parse_failed, 6);
    assert_eq!(check_rows(&root.path().join("lfw"), reader), 0);
}

#[tokio::test]
async fn test_failing_engine_does_not_abort_run() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);

    let config = runner_config(root.path(), "/bin/false", 17768);

    let (summary, mut reader) = run(root.path(), config).await;

    assert_eq!(summary.subjects, 2);
    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.process_failed, 6);
    assert_eq!(summary.succeeded, 0);
    assert!(reader.headers().unwrap().iter().eq(TrialRecorder::columns(&REPORT_SCHEMA_V1)));
    assert_eq!(reader.records().count(), 0);
}

#[tokio::test]
async fn test_stalled_engine_times_out() {
    let root = tempfile::tempdir().unwrap();
    write_dataset(&root.path().join("lfw"), PEOPLE);
    let engine = write_script(root.path(), "stall.sh", "exec sleep 30");
    let mut config = runner_config(root.path(), &engine, 17769);
    config.protocol.timeout = 1;
    config.protocol.batch_size = 4;
    config.run.nr_of_people = 1;

    let (summary, mut reader) = run(root.path(), config).await;

    // One invocation covering all four of Alice's probes.
    assert_eq!(summary.subjects, 1);
    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.timed_out, 4);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(reader.records().count(), 0);
}

#[tokio::test]
async fn test_incomparable_probes_are_skipped() {
    let root = tempfile::tempdir().unwrap();
    // Bob's embeddings are one element short of Alice's.
    write_dataset(&root.path().join("lfw"), &[("Alice", &ALICE[..], 3), ("Bob", &BOB[..3], 2)]);

    let config = runner_config(root.path(), ENGINE, 17767);

    let (summary, reader) = run(root.path(), config).await;

    // Alice keeps her two own probes, Bob keeps his one.
    assert_eq!(summary.skipped_probes, 3);
    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(check_rows(&root.path().join("lfw"), reader), 3);
}

use std::fs;
use std::net::TcpListener;
use std::process::{Command, Output};
use std::thread;
use std::time::{Duration, Instant};

use klarista::cluster::ClusterPaths;
use klarista::store::{FetchOutcome, ObjectStore, S3Store};
use klarista::sync::{RestoreOutcome, StateSync, SyncOptions, UploadOutcome};

struct DockerGuard {
    name: String,
}

impl Drop for DockerGuard {
    fn drop(&mut self) {
        let _ = Command::new("docker")
            .arg("rm")
            .arg("-f")
            .arg(&self.name)
            .status();
    }
}

fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn run_output(cmd: &mut Command) -> Output {
    cmd.output()
        .unwrap_or_else(|e| panic!("failed to run {:?}: {e}", cmd))
}

fn run_ok(cmd: &mut Command) {
    let out = run_output(cmd);
    if out.status.success() {
        return;
    }
    panic!(
        "command failed {:?}\nstatus={}\nstderr={}",
        cmd,
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("bind free port")
        .local_addr()
        .expect("local addr")
        .port()
}

fn wait_for(timeout: Duration, mut f: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return;
        }
        thread::sleep(Duration::from_millis(500));
    }
    panic!("timed out waiting for condition");
}

#[test]
#[ignore = "requires docker and aws cli"]
fn s3_state_round_trip_against_minio() {
    if !have_bin("docker") || !have_bin("aws") {
        eprintln!("skip: missing docker/aws");
        return;
    }

    let tmp = tempfile::tempdir().expect("tempdir");
    let name = format!("klarista-minio-{}-{}", std::process::id(), free_port());
    let port = free_port();
    let _guard = DockerGuard { name: name.clone() };

    run_ok(
        Command::new("docker")
            .arg("run")
            .arg("-d")
            .arg("--rm")
            .arg("--name")
            .arg(&name)
            .arg("-p")
            .arg(format!("{port}:9000"))
            .arg("-e")
            .arg("MINIO_ROOT_USER=minio")
            .arg("-e")
            .arg("MINIO_ROOT_PASSWORD=miniosecret")
            .arg("quay.io/minio/minio")
            .arg("server")
            .arg("/data"),
    );

    unsafe {
        std::env::set_var("AWS_ACCESS_KEY_ID", "minio");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "miniosecret");
        std::env::set_var("AWS_DEFAULT_REGION", "us-east-1");
    }

    let endpoint = format!("http://127.0.0.1:{port}");
    wait_for(Duration::from_secs(30), || {
        run_output(
            Command::new("aws")
                .arg("s3api")
                .arg("list-buckets")
                .arg("--endpoint-url")
                .arg(&endpoint),
        )
        .status
        .success()
    });

    let store = S3Store::new("aws").with_endpoint_url(Some(endpoint.clone()));
    let paths = ClusterPaths {
        name: "minio.example".into(),
        bucket: "minio-example-state".into(),
        key: "klarista.state.tar".into(),
        staging_dir: tmp.path().join("staging"),
    };

    let probe = tmp.path().join("probe.tar");
    assert_eq!(
        store.fetch(&paths.bucket, &paths.key, &probe).expect("fetch"),
        FetchOutcome::NoSuchBucket
    );

    run_ok(
        Command::new("aws")
            .arg("s3")
            .arg("mb")
            .arg(format!("s3://{}", paths.bucket))
            .arg("--endpoint-url")
            .arg(&endpoint),
    );
    assert_eq!(
        store.fetch(&paths.bucket, &paths.key, &probe).expect("fetch"),
        FetchOutcome::NoSuchKey
    );

    let sync = StateSync::new(Box::new(store));
    let first = sync
        .session(&paths, SyncOptions::full(), |sess| {
            fs::create_dir_all(sess.root().join("tf"))?;
            fs::write(sess.root().join("tf/output.json"), "{\"ok\": true}")?;
            Ok(())
        })
        .expect("first session");
    assert_eq!(first.restore, RestoreOutcome::NotFound);
    assert_eq!(
        first.upload,
        Some(UploadOutcome::Stored {
            location: "s3://minio-example-state/klarista.state.tar".into()
        })
    );

    let fresh = paths.clone().with_staging_dir(tmp.path().join("fresh"));
    let second = sync
        .session(&fresh, SyncOptions::fetch_only(), |sess| {
            Ok(fs::read_to_string(sess.root().join("tf/output.json"))?)
        })
        .expect("second session");
    assert_eq!(second.restore, RestoreOutcome::Restored);
    assert_eq!(second.value, "{\"ok\": true}");
}

//! Asynchronous integration against a live MinIO endpoint. The suite runs
//! only when the AWS_S3_* environment variables point at one; otherwise it
//! skips, like the rest of the integration tier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::{Rng, SeedableRng};

use blobnet::transaction::Transaction;
use blobnet::{Provider, WorkerGroup};
use blobnet_cloud::{make_provider, remote_info, MinIo};

struct Environment {
    url: String,
    key: String,
    secret: String,
}

fn environment() -> Option<Environment> {
    let bucket = std::env::var("AWS_S3_BUCKET").ok()?;
    let region = std::env::var("AWS_S3_REGION").ok()?;
    let endpoint = std::env::var("AWS_S3_ENDPOINT").ok()?;
    let key = std::env::var("AWS_S3_ACCESS_KEY").ok()?;
    let secret = std::env::var("AWS_S3_SECRET_ACCESS_KEY").ok()?;
    Some(Environment {
        url: format!("minio://{endpoint}/{bucket}:{region}"),
        key,
        secret,
    })
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) {
    let begin = Instant::now();
    while !done() {
        assert!(begin.elapsed() < deadline, "integration step timed out");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn random_blob(len: usize) -> Vec<u8> {
    let mut rng = rand::rngs::SmallRng::seed_from_u64(0x5eed);
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn minio_asynchronous_integration() {
    let Some(env) = environment() else {
        eprintln!("AWS_S3_* environment not set, skipping MinIO integration");
        return;
    };

    let provider = make_provider(&env.url, false, &env.key, &env.secret).unwrap();
    let group = WorkerGroup::new(20, 256);

    let file_names = ["test.txt", "long.txt"];
    let contents: [Vec<u8>; 2] = [b"Hello World!".to_vec(), random_blob(1 << 24)];

    std::thread::scope(|scope| {
        let mut handle = group.get_handle().unwrap();
        let stopper = handle.stopper();
        let runner = scope.spawn(move || handle.process(false));

        // Plain uploads.
        {
            let finished = Arc::new(AtomicUsize::new(0));
            let mut txn = Transaction::new(provider.clone());
            for at in 0..2 {
                let seen = finished.clone();
                txn.add_put_with_callback(
                    file_names[at],
                    Bytes::from(contents[at].clone()),
                    Box::new(move |result| {
                        assert!(result.success(), "{:?}", result.failure_code());
                        seen.fetch_add(1, Ordering::Relaxed);
                    }),
                )
                .unwrap();
            }
            assert!(txn.process_async(&group));
            wait_until(Duration::from_secs(120), || {
                finished.load(Ordering::Relaxed) == 2
            });
        }

        // Multipart upload of the large blob, 6 MiB parts.
        {
            let minio = Arc::new(
                MinIo::new(remote_info(&env.url).unwrap(), false, &env.key, &env.secret).unwrap(),
            );
            minio.set_multipart_upload_size(6 << 20);
            let minio: Arc<dyn Provider> = minio;

            let finished = Arc::new(AtomicUsize::new(0));
            let mut txn = Transaction::new(minio);
            let seen = finished.clone();
            txn.add_put_with_callback(
                file_names[1],
                Bytes::from(contents[1].clone()),
                Box::new(move |result| {
                    assert!(result.success(), "{:?}", result.failure_code());
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();

            // Keep submitting as the upload advances through its phases.
            wait_until(Duration::from_secs(300), || {
                assert!(txn.process_async(&group));
                finished.load(Ordering::Relaxed) == 1
            });
            assert!(txn.multiparts_done());

            let record = txn.multipart_uploads()[0].lock().unwrap();
            // 16 MiB over 6 MiB parts: three parts, etags in order.
            assert_eq!(record.etags.len(), 3);
            assert!(record.etags.iter().all(|etag| etag.is_some()));
        }

        // Multipart with an undersized part limit must fail: the S3 API
        // requires 5 MiB parts.
        {
            let minio = Arc::new(
                MinIo::new(remote_info(&env.url).unwrap(), false, &env.key, &env.secret).unwrap(),
            );
            minio.set_multipart_upload_size(1 << 20);
            let minio: Arc<dyn Provider> = minio;

            let finished = Arc::new(AtomicUsize::new(0));
            let mut txn = Transaction::new(minio);
            let seen = finished.clone();
            txn.add_put_with_callback(
                file_names[1],
                Bytes::from(contents[1].clone()),
                Box::new(move |result| {
                    assert!(!result.success());
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
            wait_until(Duration::from_secs(300), || {
                assert!(txn.process_async(&group));
                finished.load(Ordering::Relaxed) == 1
            });
        }

        // Downloads come back byte-identical.
        {
            let finished = Arc::new(AtomicUsize::new(0));
            let mut txn = Transaction::new(provider.clone());
            for at in 0..2 {
                let seen = finished.clone();
                let expected = contents[at].clone();
                txn.add_get_with_callback(
                    file_names[at],
                    None,
                    Box::new(move |result| {
                        assert!(result.success(), "{:?}", result.failure_code());
                        assert_eq!(result.size() as usize, expected.len());
                        assert_eq!(result.body(), &expected[..]);
                        seen.fetch_add(1, Ordering::Relaxed);
                    }),
                )
                .unwrap();
            }
            assert!(txn.process_async(&group));
            wait_until(Duration::from_secs(120), || {
                finished.load(Ordering::Relaxed) == 2
            });
        }

        // Cleanup.
        {
            let finished = Arc::new(AtomicUsize::new(0));
            let mut txn = Transaction::new(provider.clone());
            for name in file_names {
                let seen = finished.clone();
                txn.add_delete_with_callback(
                    name,
                    Box::new(move |result| {
                        assert!(result.success());
                        seen.fetch_add(1, Ordering::Relaxed);
                    }),
                )
                .unwrap();
            }
            assert!(txn.process_async(&group));
            wait_until(Duration::from_secs(60), || {
                finished.load(Ordering::Relaxed) == 2
            });
        }

        stopper.stop();
        runner.join().unwrap();
    });
}

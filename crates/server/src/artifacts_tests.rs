// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::testutil::test_config;

#[test]
fn stub_presign_signs_local_upload_url() -> anyhow::Result<()> {
    let presigner = Presigner::new(&test_config());
    let upload = presigner.presign_upload("t-1", "screen.png");

    assert_eq!(upload.method, "PUT");
    assert!(upload.url.starts_with("/artifacts/upload/t-1/screen.png?expires="));
    assert!(upload.url.contains("&signature="));
    Ok(())
}

#[test]
fn s3_presign_targets_bucket_path() {
    let mut config = test_config();
    config.artifacts_endpoint = Some("https://minio.internal:9000/".to_owned());
    config.artifacts_bucket = Some("artifacts".to_owned());
    config.artifacts_secret_key = Some("s3-secret".to_owned());

    let upload = Presigner::new(&config).presign_upload("t-1", "out.txt");
    assert!(upload.url.starts_with("https://minio.internal:9000/artifacts/t-1/out.txt?"));
}

#[test]
fn verify_accepts_own_signature_and_rejects_tampering() -> anyhow::Result<()> {
    let presigner = Presigner::new(&test_config());
    let upload = presigner.presign_upload("t-1", "a.bin");

    let (path, query) = upload
        .url
        .split_once('?')
        .ok_or_else(|| anyhow::anyhow!("presigned url missing query"))?;
    let mut expires = 0i64;
    let mut signature = String::new();
    for pair in query.split('&') {
        if let Some(v) = pair.strip_prefix("expires=") {
            expires = v.parse()?;
        }
        if let Some(v) = pair.strip_prefix("signature=") {
            signature = v.to_owned();
        }
    }

    assert!(presigner.verify_upload(path, expires, &signature));
    assert!(!presigner.verify_upload(path, expires, "deadbeef"));
    assert!(!presigner.verify_upload("/artifacts/upload/t-2/a.bin", expires, &signature));
    // Expired timestamps always fail.
    assert!(!presigner.verify_upload(path, 1, &signature));
    Ok(())
}

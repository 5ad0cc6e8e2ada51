mod common;

use std::sync::{Arc, OnceLock};

use photo3d_contracts::providers::GenerationOptions;
use photo3d_contracts::tasks::{ModelFormat, TaskStatus};
use photo3d_contracts::views::ViewAngle;
use photo3d_contracts::{GenerationError, GenerationResult};
use photo3d_engine::config::ApiKeyCredential;
use photo3d_engine::providers::{
    HunyuanAdapter, InputImage, MeshyAdapter, ProviderAdapter, RequestSigner, SignableRequest,
};
use serde_json::json;

use common::{MockServer, Reply};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
const GLB: &[u8] = b"glTF\x02\0\0\0\x0c\0\0\0";

fn meshy(base_url: &str, path: &str) -> GenerationResult<MeshyAdapter> {
    MeshyAdapter::new(&ApiKeyCredential {
        api_key: Some("test-key".to_string()),
        api_base: Some(format!("{base_url}{path}")),
    })
}

#[test]
fn meshy_submits_polls_and_downloads() -> anyhow::Result<()> {
    let base: Arc<OnceLock<String>> = Arc::new(OnceLock::new());
    let handler_base = Arc::clone(&base);
    let server = MockServer::start(move |request| {
        let base = handler_base.get().cloned().unwrap_or_default();
        match (request.method.as_str(), request.path.as_str()) {
            ("POST", "/openapi/v1/image-to-3d") => Reply::json(202, json!({ "result": "task-123" })),
            ("GET", "/openapi/v1/image-to-3d/task-123") => Reply::json(
                200,
                json!({
                    "id": "task-123",
                    "status": "SUCCEEDED",
                    "progress": 100,
                    "model_urls": {
                        "glb": format!("{base}/files/model.glb?Expires=1"),
                        "fbx": ""
                    },
                    "thumbnail_url": format!("{base}/files/preview.png")
                }),
            ),
            ("GET", "/files/model.glb?Expires=1") => Reply::bytes(GLB),
            _ => Reply::json(404, json!({ "message": "not found" })),
        }
    });
    let _ = base.set(server.base_url.clone());
    let adapter = meshy(&server.base_url, "/openapi/v1")?;

    let submitted = adapter.generate_from_image(
        &InputImage::new(PNG.to_vec(), "image/png"),
        &GenerationOptions::default(),
    )?;
    assert_eq!(submitted.task_id, "task-123");

    let status = adapter.check_status(&submitted.task_id, None)?;
    assert_eq!(status.status, TaskStatus::Completed);
    assert_eq!(status.progress, Some(100));

    let listing = adapter.get_download_urls(&submitted.task_id, Some(ModelFormat::Glb))?;
    assert_eq!(listing.files.len(), 1);
    let glb = listing.find(ModelFormat::Glb).map(|file| file.url.clone()).unwrap_or_default();
    assert!(listing.thumbnail_url.is_some());
    assert_eq!(adapter.download_model(&glb)?, GLB.to_vec());

    let requests = server.requests();
    let submission = &requests[0];
    assert_eq!(submission.header("authorization"), Some("Bearer test-key"));
    let body = submission.json();
    assert_eq!(body["target_polycount"], 30_000);
    assert!(body["image_url"]
        .as_str()
        .unwrap_or_default()
        .starts_with("data:image/png;base64,"));
    Ok(())
}

#[test]
fn meshy_http_failures_are_classified() -> anyhow::Result<()> {
    let server = MockServer::start(|request| {
        if request.path.starts_with("/unauthorized/") {
            Reply::json(401, json!({ "message": "Invalid API key" }))
        } else if request.path.starts_with("/limited/") {
            Reply::json(429, json!({ "message": "Too many requests" }))
        } else {
            Reply::json(402, json!({ "message": "Insufficient credits" }))
        }
    });
    let image = InputImage::new(PNG.to_vec(), "image/png");
    let options = GenerationOptions::default();

    let unauthorized = meshy(&server.base_url, "/unauthorized")?.generate_from_image(&image, &options);
    assert!(matches!(unauthorized, Err(GenerationError::Unauthenticated { .. })));
    let limited = meshy(&server.base_url, "/limited")?.generate_from_image(&image, &options);
    assert!(matches!(limited, Err(GenerationError::RateLimited { .. })));
    let broke = meshy(&server.base_url, "/broke")?.generate_from_image(&image, &options);
    assert!(matches!(broke, Err(GenerationError::InsufficientProviderCredit { .. })));
    Ok(())
}

struct StaticSigner;

impl RequestSigner for StaticSigner {
    fn sign(&self, request: &SignableRequest<'_>) -> GenerationResult<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".to_string(),
            format!("Test host={} bytes={}", request.host, request.payload.len()),
        )])
    }
}

#[test]
fn hunyuan_sends_signed_actions_and_reads_envelopes() -> anyhow::Result<()> {
    let server = MockServer::start(|request| match request.header("x-tc-action") {
        Some("SubmitHunyuanTo3DJob") => Reply::json(
            200,
            json!({ "Response": { "JobId": "job-7", "RequestId": "req-1" } }),
        ),
        Some("QueryHunyuanTo3DJob") => Reply::json(
            200,
            json!({
                "Response": {
                    "Status": "DONE",
                    "ResultFile3Ds": [{
                        "Type": "GLB",
                        "Url": "https://cdn.test/job-7/model.glb",
                        "PreviewImageUrl": "https://cdn.test/job-7/preview.png"
                    }],
                    "RequestId": "req-2"
                }
            }),
        ),
        _ => Reply::json(
            200,
            json!({ "Response": { "Error": { "Code": "InvalidAction", "Message": "unknown" } } }),
        ),
    });
    let adapter = HunyuanAdapter::with_signer(&server.base_url, "ap-guangzhou", Box::new(StaticSigner))?;

    let images = vec![
        InputImage::new(PNG.to_vec(), "image/png").with_view(ViewAngle::Back),
        InputImage::new(PNG.to_vec(), "image/png").with_view(ViewAngle::Front),
    ];
    let submitted = adapter.generate_from_multiple_images(&images, &GenerationOptions::default())?;
    assert_eq!(submitted.task_id, "job-7");

    let status = adapter.check_status("job-7", None)?;
    assert_eq!(status.status, TaskStatus::Completed);
    let listing = adapter.get_download_urls("job-7", None)?;
    assert_eq!(
        listing.find(ModelFormat::Glb).map(|file| file.url.as_str()),
        Some("https://cdn.test/job-7/model.glb")
    );
    assert_eq!(listing.thumbnail_url.as_deref(), Some("https://cdn.test/job-7/preview.png"));

    let requests = server.requests();
    let submission = &requests[0];
    assert_eq!(submission.header("x-tc-version"), Some("2025-05-13"));
    assert_eq!(submission.header("x-tc-region"), Some("ap-guangzhou"));
    assert!(submission
        .header("authorization")
        .unwrap_or_default()
        .starts_with("Test host=127.0.0.1:"));
    let body = submission.json();
    assert_eq!(body["FaceCount"], 150_000);
    assert_eq!(body["MultiViewImages"][0]["ViewType"], "back");
    assert!(body["ImageBase64"].as_str().is_some());
    Ok(())
}

#[test]
fn hunyuan_envelope_errors_keep_their_class() -> anyhow::Result<()> {
    let server = MockServer::start(|_| {
        Reply::json(
            200,
            json!({
                "Response": {
                    "Error": { "Code": "AuthFailure.SignatureFailure", "Message": "signature mismatch" },
                    "RequestId": "req-3"
                }
            }),
        )
    });
    let adapter = HunyuanAdapter::with_signer(&server.base_url, "ap-guangzhou", Box::new(StaticSigner))?;
    let result = adapter.check_status("job-7", None);
    match result {
        Err(GenerationError::Unauthenticated { message, .. }) => {
            assert!(message.contains("signature mismatch"));
        }
        other => panic!("expected unauthenticated, got {other:?}"),
    }
    Ok(())
}

//! Separation Service Client Integration Tests
//!
//! Exercises `HttpSeparationClient` against a wiremock stand-in for the
//! remote service.
//!
//! ## Test Coverage
//!
//! - Authorization header on every authenticated call
//! - Upload, split and check wire formats
//! - Error bodies, non-2xx statuses and transport failures
//! - Track download without credentials

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use stem_proxy::config::UpstreamConfig;
    use stem_proxy::upstream::{
        HttpSeparationClient, SeparationService, TaskState, UpstreamError,
    };
    use stem_proxy::Stem;
    use wiremock::matchers::{body_bytes, body_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> HttpSeparationClient {
        HttpSeparationClient::new(&UpstreamConfig {
            base_url: server.uri(),
            api_key: "k-123".into(),
            auth_scheme: "license".into(),
            timeout_seconds: 2,
            upload_signing_secret: "s".into(),
            credential_ttl_seconds: 900,
        })
        .unwrap()
    }

    // ========================================================================
    // upload
    // ========================================================================

    #[tokio::test]
    async fn test_upload_returns_asset_id() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/upload/"))
            .and(header("authorization", "license k-123"))
            .and(header("content-disposition", "attachment; filename=\"song.mp3\""))
            .and(body_bytes(b"RIFFDATA".to_vec()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"status": "success", "id": "asset-42"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = client_for(&server)
            .upload(Bytes::from_static(b"RIFFDATA"), "song.mp3")
            .await
            .unwrap();
        assert_eq!(id, "asset-42");
    }

    #[tokio::test]
    async fn test_upload_error_body_is_rejection() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/upload/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "error", "error": "quota exhausted"})),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .upload(Bytes::from_static(b"x"), "song.mp3")
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::Rejected("quota exhausted".into()));
    }

    #[tokio::test]
    async fn test_upload_server_error_is_transient() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/upload/"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .upload(Bytes::from_static(b"x"), "song.mp3")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::Status { status: 503, ref body } if body == "maintenance"));
        assert!(err.is_transient());
    }

    // ========================================================================
    // start_split
    // ========================================================================

    #[tokio::test]
    async fn test_start_split_sends_stem() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/split/"))
            .and(header("authorization", "license k-123"))
            .and(body_json(json!({"id": "asset-42", "stem": "electric_guitar"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let ack = client_for(&server)
            .start_split("asset-42", Stem::ElectricGuitar)
            .await
            .unwrap();
        assert!(ack.accepted);
    }

    #[tokio::test]
    async fn test_start_split_refusal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/split/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "error", "error": "unknown asset"})),
            )
            .mount(&server)
            .await;

        let ack = client_for(&server)
            .start_split("nope", Stem::Vocals)
            .await
            .unwrap();
        assert!(!ack.accepted);
        assert_eq!(ack.message.as_deref(), Some("unknown asset"));
    }

    // ========================================================================
    // check_task
    // ========================================================================

    #[tokio::test]
    async fn test_check_task_in_progress() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/check/"))
            .and(query_param("id", "asset-42"))
            .and(header("authorization", "license k-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": {"asset-42": {"task": {"state": "progress"}}}
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).check_task("asset-42").await.unwrap();
        assert_eq!(status.state, TaskState::Processing);
        assert!(status.back_track_url.is_none());
    }

    #[tokio::test]
    async fn test_check_task_success_carries_links() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/check/"))
            .and(query_param("id", "asset-42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": {"asset-42": {
                    "task": {"state": "success"},
                    "split": {
                        "back_track": "https://cdn.example/back.mp3",
                        "stem_track": "https://cdn.example/stem.mp3"
                    }
                }}
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).check_task("asset-42").await.unwrap();
        assert_eq!(status.state, TaskState::Success);
        assert_eq!(
            status.back_track_url.as_deref(),
            Some("https://cdn.example/back.mp3")
        );
        assert_eq!(
            status.stem_track_url.as_deref(),
            Some("https://cdn.example/stem.mp3")
        );
    }

    #[tokio::test]
    async fn test_check_task_error_state() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/check/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "result": {"asset-42": {"task": {"state": "error", "error": "decode failed"}}}
            })))
            .mount(&server)
            .await;

        let status = client_for(&server).check_task("asset-42").await.unwrap();
        assert_eq!(status.state, TaskState::Error);
        assert_eq!(status.error.as_deref(), Some("decode failed"));
    }

    #[tokio::test]
    async fn test_check_task_garbage_is_decode_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/check/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client_for(&server).check_task("asset-42").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Decode(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_transport_error() {
        // Nothing listens on a port we bound and released
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = HttpSeparationClient::new(&UpstreamConfig {
            base_url: format!("http://127.0.0.1:{}", port),
            api_key: "k-123".into(),
            auth_scheme: "license".into(),
            timeout_seconds: 2,
            upload_signing_secret: "s".into(),
            credential_ttl_seconds: 900,
        })
        .unwrap();

        let err = client.check_task("asset-42").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Transport(_)));
        assert!(err.is_transient());
    }

    // ========================================================================
    // fetch_track
    // ========================================================================

    #[tokio::test]
    async fn test_fetch_track_without_credentials() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files/back.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3audio".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        // The API key must never reach the file host
        Mock::given(method("GET"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let bytes = client_for(&server)
            .fetch_track(&format!("{}/files/back.mp3", server.uri()))
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"ID3audio");
    }

    #[tokio::test]
    async fn test_fetch_track_over_cap_rejected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/files/huge.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .with_max_download(1024)
            .fetch_track(&format!("{}/files/huge.mp3", server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err, UpstreamError::TooLarge { limit: 1024 });
        assert!(!err.is_transient());
    }
}

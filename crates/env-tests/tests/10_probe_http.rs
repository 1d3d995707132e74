//! Probe Tests: HTTP validation
//!
//! Exercises `ReqwestProbe` against a local mock server standing in for the
//! tunnelled nginx service.

use highway_env_tests::probe::{
    status_and_body_contains, HttpProbe, ProbeError, ProbeOptions, ReqwestProbe,
};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EXPECTED: &str = "<h1>Welcome to nginx!</h1>";

const WELCOME_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Welcome to nginx!</title></head>
<body>
<h1>Welcome to nginx!</h1>
<p>If you see this page, the nginx web server is successfully installed and
working. Further configuration is required.</p>
</body>
</html>"#;

async fn server_returning(status: u16, body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .expect(1)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_welcome_page_passes() {
    let server = server_returning(200, WELCOME_PAGE).await;
    let validator = status_and_body_contains(200, EXPECTED);

    let response = ReqwestProbe::new()
        .get_with_validation(&server.uri(), &ProbeOptions::default(), &validator)
        .await
        .expect("welcome page should pass");

    assert_eq!(response.status, 200);
    assert!(response.body.contains(EXPECTED));
}

#[tokio::test]
async fn test_wrong_body_fails_validation() {
    let server = server_returning(200, "<h1>Goodbye</h1>").await;
    let validator = status_and_body_contains(200, EXPECTED);

    let err = ReqwestProbe::new()
        .get_with_validation(&server.uri(), &ProbeOptions::default(), &validator)
        .await
        .expect_err("goodbye page should fail");

    match err {
        ProbeError::ValidationFailed { status, body, .. } => {
            assert_eq!(status, 200);
            assert_eq!(body, "<h1>Goodbye</h1>");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_unavailable_status_fails_validation() {
    let server = server_returning(503, WELCOME_PAGE).await;
    let validator = status_and_body_contains(200, EXPECTED);

    let err = ReqwestProbe::new()
        .get_with_validation(&server.uri(), &ProbeOptions::default(), &validator)
        .await
        .expect_err("503 should fail");

    assert!(matches!(
        err,
        ProbeError::ValidationFailed { status: 503, .. }
    ));
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(WELCOME_PAGE)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let options = ProbeOptions {
        timeout: Duration::from_millis(200),
    };
    let validator = status_and_body_contains(200, EXPECTED);

    let err = ReqwestProbe::new()
        .get_with_validation(&server.uri(), &options, &validator)
        .await
        .expect_err("request should time out");

    match err {
        ProbeError::Request { source, .. } => assert!(source.is_timeout()),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_connection_refused_is_request_error() {
    // Bind then drop to get a port nothing listens on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let validator = status_and_body_contains(200, EXPECTED);
    let err = ReqwestProbe::new()
        .get_with_validation(
            &format!("http://localhost:{port}"),
            &ProbeOptions::default(),
            &validator,
        )
        .await
        .expect_err("nothing is listening");

    assert!(matches!(err, ProbeError::Request { .. }));
}

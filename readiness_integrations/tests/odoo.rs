use chrono::NaiveDate;
use readiness_core::{AgingBucket, Connector, ConnectorContext, Credentials, Error, OrgId, SourceId};
use readiness_integrations::connectors::odoo::{OdooConnector, SessionState};
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH_PATH: &str = "/web/session/authenticate";
const CALL_PATH: &str = "/web/dataset/call_kw";

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn ctx(server: &MockServer) -> ConnectorContext {
    ConnectorContext {
        org_id: OrgId(Uuid::new_v4()),
        source_id: SourceId::new(),
        credentials: Credentials::OdooSession {
            base_url: server.uri(),
            database: "prod".to_string(),
            username: "bot@example.com".to_string(),
            password: "pw".to_string(),
        },
    }
}

fn login_ok(session: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("set-cookie", format!("session_id={session}; Path=/; HttpOnly").as_str())
        .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"uid": 2}}))
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

#[tokio::test]
async fn logs_in_lazily_and_reuses_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .and(body_partial_json(json!({"params": {"db": "prod", "login": "bot@example.com"}})))
        .respond_with(login_ok("sess1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .and(header("cookie", "session_id=sess1"))
        .and(body_partial_json(json!({"params": {"model": "account.move", "method": "search_read"}})))
        .respond_with(rpc_result(json!([
            {"id": 1, "invoice_date": "2024-05-02", "amount_untaxed": 100.0, "amount_total": 121.0},
            {"id": 2, "invoice_date": "2024-05-03", "amount_untaxed": 10.0, "amount_total": 12.1}
        ])))
        .expect(2)
        .mount(&server)
        .await;

    let connector = OdooConnector::new().unwrap();
    let ctx = ctx(&server);
    assert_eq!(
        connector.session_state(ctx.source_id).await,
        SessionState::Unauthenticated
    );

    for _ in 0..2 {
        let rows = connector
            .pull_sales_daily(&ctx, d(2024, 5, 1), d(2024, 5, 31))
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].gross_amount, Decimal::new(121, 0));
        assert_eq!(rows[0].channel.as_deref(), Some("odoo"));
    }

    assert_eq!(
        connector.session_state(ctx.source_id).await,
        SessionState::Authenticated {
            session_id: "sess1".to_string(),
            uid: 2
        }
    );
}

#[tokio::test]
async fn expired_session_is_renewed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(login_ok("sess1"))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(login_ok("sess2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .and(header("cookie", "session_id=sess1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": 100,
                "message": "Odoo Session Expired",
                "data": {"name": "odoo.http.SessionExpiredException", "message": "Session expired"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .and(header("cookie", "session_id=sess2"))
        .respond_with(rpc_result(json!([
            {"id": 7, "invoice_date": "2024-05-16", "amount_residual": 500.0}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let connector = OdooConnector::new().unwrap();
    let rows = connector
        .pull_ar_aging(&ctx(&server), d(2024, 6, 30))
        .await
        .unwrap();

    assert_eq!(rows.len(), 4);
    let over = rows
        .iter()
        .find(|r| r.bucket == AgingBucket::Days31To60)
        .unwrap();
    assert_eq!(over.amount, Decimal::new(500, 0));
    assert!(rows
        .iter()
        .filter(|r| r.bucket != AgingBucket::Days31To60)
        .all(|r| r.amount == Decimal::ZERO));
}

#[tokio::test]
async fn rejected_login_is_unauthorized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": 200,
                "message": "Odoo Server Error",
                "data": {"name": "odoo.exceptions.AccessDenied", "message": "Access Denied"}
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .respond_with(rpc_result(json!(0)))
        .expect(0)
        .mount(&server)
        .await;

    let connector = OdooConnector::new().unwrap();
    let err = connector.test_connection(&ctx(&server)).await.unwrap_err();
    assert!(matches!(err, Error::Unauthorized(ref m) if m.contains("Access Denied")), "{err}");
}

#[tokio::test]
async fn connection_test_counts_invoices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(login_ok("sess1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .and(body_partial_json(json!({"params": {"method": "search_count"}})))
        .respond_with(rpc_result(json!(12)))
        .expect(1)
        .mount(&server)
        .await;

    let connector = OdooConnector::new().unwrap();
    let check = connector.test_connection(&ctx(&server)).await.unwrap();
    assert!(check.ok);
    assert_eq!(check.sample_size, Some(12));
}

#[tokio::test]
async fn rpc_error_fails_without_relogin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(AUTH_PATH))
        .respond_with(login_ok("sess1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CALL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 200, "message": "Odoo Server Error", "data": {"name": "builtins.ValueError", "message": "Invalid field"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let connector = OdooConnector::new().unwrap();
    let err = connector
        .pull_ap_aging(&ctx(&server), d(2024, 6, 30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Upstream { .. }), "{err}");
}

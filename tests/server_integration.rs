use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use sheetpilot::assistant::{CompletionRequest, CompletionResponse, ContentBlock, LlmClient};
use sheetpilot::config::ServerConfig;
use sheetpilot::server::router;
use sheetpilot::state::AppState;
use std::sync::Arc;

mod support;

struct Scripted {
    responses: Mutex<Vec<CompletionResponse>>,
}

impl Scripted {
    fn new(mut responses: Vec<CompletionResponse>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
        }
    }
}

#[async_trait]
impl LlmClient for Scripted {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
        self.responses
            .lock()
            .pop()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
}

fn tool_call(id: &str, name: &str, input: Value) -> CompletionResponse {
    CompletionResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: Some("tool_use".into()),
        usage: None,
    }
}

fn done(text: &str) -> CompletionResponse {
    CompletionResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: Some("end_turn".into()),
        usage: None,
    }
}

struct TestServer {
    base: String,
    http: reqwest::Client,
    _workspace: support::TestWorkspace,
}

impl TestServer {
    async fn start(llm: Option<Arc<dyn LlmClient>>, tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let workspace = support::TestWorkspace::new();
        let config = Arc::new(workspace.config_with(tweak));
        let state = match llm {
            Some(client) => AppState::with_llm_client(config, client),
            None => AppState::new(config).expect("state"),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(Arc::new(state))).await;
        });
        Self {
            base: format!("http://{addr}/api"),
            http: reqwest::Client::new(),
            _workspace: workspace,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn upload(&self, bytes: Vec<u8>) -> reqwest::Response {
        self.http
            .post(self.url("/workbooks?filename=budget.xlsx"))
            .body(bytes)
            .send()
            .await
            .expect("upload")
    }

    async fn open_budget(&self) -> String {
        let response = self
            .upload(support::workbook_bytes(support::budget_book))
            .await;
        assert_eq!(response.status(), 200);
        let summary: Value = response.json().await.expect("summary");
        summary["session_id"].as_str().expect("session id").to_string()
    }

    async fn post_json(&self, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("post")
    }
}

fn view_value(view: &Value, row: usize, col: usize) -> Value {
    view["rows"][row][col]["value"].clone()
}

#[tokio::test(flavor = "current_thread")]
async fn upload_edit_and_export_round_trip() {
    let server = TestServer::start(None, |_| {}).await;

    let health: Value = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["assistant"], false);

    let id = server.open_budget().await;

    let view: Value = server
        .http
        .get(server.url(&format!("/workbooks/{id}/sheets/Sheet1")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view_value(&view, 4, 1), json!(1650.0));

    let edit = server
        .post_json(
            &format!("/workbooks/{id}/cells"),
            json!({"cell": "B2", "input": "2000"}),
        )
        .await;
    assert_eq!(edit.status(), 200);
    let edit: Value = edit.json().await.unwrap();
    assert_eq!(edit["revision"], 1);
    assert_eq!(view_value(&edit["view"], 4, 1), json!(2450.0));

    let changes = server
        .post_json(
            &format!("/workbooks/{id}/changes"),
            json!({"changes": [{"kind": "insert_row", "row": 2}]}),
        )
        .await;
    assert_eq!(changes.status(), 200);
    let changes: Value = changes.json().await.unwrap();
    assert_eq!(changes["summary"]["counts"]["rows_inserted"], 1);

    let export = server
        .http
        .get(server.url(&format!("/workbooks/{id}/export?mode=patch")))
        .send()
        .await
        .unwrap();
    assert_eq!(export.status(), 200);
    assert_eq!(
        export.headers()["content-type"],
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    );
    let disposition = export.headers()["content-disposition"].to_str().unwrap().to_string();
    assert!(disposition.contains("budget.xlsx"));
    let bytes = export.bytes().await.unwrap();
    let book = support::read_back(&bytes);
    let sheet = book.get_sheet_by_name("Sheet1").unwrap();
    assert_eq!(sheet.get_value("B3"), "2000");
    assert_eq!(sheet.get_cell("B6").unwrap().get_formula(), "SUM(B3:B5)");
}

#[tokio::test(flavor = "current_thread")]
async fn error_statuses_follow_error_kinds() {
    let server = TestServer::start(None, |cfg| cfg.max_upload_bytes = Some(64 * 1024)).await;

    let not_xlsx = server.upload(b"just text".to_vec()).await;
    assert_eq!(not_xlsx.status(), 400);

    let too_large = server.upload(vec![b'P'; 128 * 1024]).await;
    assert_eq!(too_large.status(), 413);
    let body: Value = too_large.json().await.expect("json error body");
    assert!(body["error"].as_str().unwrap().contains("limit"));

    let missing = server
        .http
        .get(server.url("/workbooks/doesnotexist"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let id = server.open_budget().await;

    let empty = server
        .post_json(&format!("/workbooks/{id}/changes"), json!({"changes": []}))
        .await;
    assert_eq!(empty.status(), 400);
    let body: Value = empty.json().await.unwrap();
    assert_eq!(body["path"], "changes");

    let bad_sheet = server
        .post_json(
            &format!("/workbooks/{id}/active-sheet"),
            json!({"sheet": "Nope"}),
        )
        .await;
    assert_eq!(bad_sheet.status(), 400);

    let chat = server
        .post_json(
            &format!("/workbooks/{id}/chat"),
            json!({"message": "add a total"}),
        )
        .await;
    assert_eq!(chat.status(), 503);

    let closed = server
        .http
        .delete(server.url(&format!("/workbooks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(closed.status(), 200);
    let again = server
        .http
        .get(server.url(&format!("/workbooks/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 404);
}

#[tokio::test(flavor = "current_thread")]
async fn chat_previews_changes_until_applied() {
    let llm: Arc<dyn LlmClient> = Arc::new(Scripted::new(vec![
        tool_call(
            "t1",
            "set_value",
            json!({"cell": "B3", "value": 500}),
        ),
        done("Raised groceries to 500."),
        tool_call(
            "t2",
            "set_formula",
            json!({"cell": "C5", "formula": "=B5/4"}),
        ),
        done("Added a quarterly figure."),
    ]));
    let server = TestServer::start(Some(llm), |_| {}).await;
    let id = server.open_budget().await;

    let reply = server
        .post_json(
            &format!("/workbooks/{id}/chat"),
            json!({"message": "groceries should be 500", "selection": "B3"}),
        )
        .await;
    assert_eq!(reply.status(), 200);
    let reply: Value = reply.json().await.unwrap();
    assert_eq!(reply["message"], "Raised groceries to 500.");
    assert_eq!(reply["applied"], false);
    assert_eq!(reply["changes"][0]["kind"], "set_value");
    assert_eq!(reply["previews"][0]["after"], json!(500.0));

    let summary: Value = server
        .http
        .get(server.url(&format!("/workbooks/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(summary["revision"], 0, "preview must not touch the session");

    let reply: Value = server
        .post_json(
            &format!("/workbooks/{id}/chat"),
            json!({"message": "add a quarterly figure", "auto_apply": true}),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(reply["applied"], true);
    assert_eq!(reply["summary"]["ops_applied"], 1);

    let view: Value = server
        .http
        .get(server.url(&format!("/workbooks/{id}/sheets/Sheet1")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view_value(&view, 4, 2), json!(412.5));
}

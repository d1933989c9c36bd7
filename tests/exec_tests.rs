mod common;

use actix_web::http::StatusCode;
use actix_web::{App, test};
use assert_json_diff::assert_json_include;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use sandbox_server::web_server::configure_app;

use common::{TestEnv, upload_request};

fn exec_request(body: Value) -> actix_web::test::TestRequest {
    test::TestRequest::post().uri("/exec").set_json(body)
}

#[actix_web::test]
async fn test_exec_prints_result() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = exec_request(json!({ "lang": "py", "code": "print(1+1)" })).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_json_include!(
        actual: body.clone(),
        expected: json!({ "stdout": "2\n", "stderr": "", "exitCode": 0, "files": [] })
    );
    assert!(!body["session_id"].as_str().unwrap().is_empty());

    let stats = env.state.queue.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.running, 0);

    let execs = env.audit_by_action("exec").await;
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].status, "success");
    assert_json_include!(
        actual: execs[0].details.clone(),
        expected: json!({ "lang": "py", "exitCode": 0, "filesGenerated": 0, "codePreview": "print(1+1)" })
    );
}

#[actix_web::test]
async fn test_exec_passes_through_exit_code() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = exec_request(json!({
        "lang": "py",
        "code": "import sys; sys.exit(3)",
        "session_id": "sess-exit",
    }))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body,
        expected: json!({ "session_id": "sess-exit", "exitCode": 3, "stderr": "exiting with 3\n" })
    );

    let execs = env.audit_by_action("exec").await;
    assert_eq!(execs[0].status, "error");
    assert_eq!(execs[0].error.as_deref(), Some("exiting with 3\n"));
    assert_eq!(execs[0].session_id.as_deref(), Some("sess-exit"));
}

#[actix_web::test]
async fn test_exec_generated_file_is_downloadable() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = exec_request(json!({
        "lang": "python",
        "code": "open('out.csv', 'w').write('a,b\\n1,2\\n')",
        "session_id": "sess-out",
    }))
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let files = body["files"].as_array().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0]["name"], "out.csv");
    let file_id = files[0]["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri(&format!("/download/sess-out/{file_id}"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let content = test::read_body(resp).await;
    assert_eq!(content.as_ref(), b"a,b\n1,2\n");

    let req = test::TestRequest::get()
        .uri("/files/sess-out?detail=full")
        .to_request();
    let listing: Value = test::call_and_read_body_json(&app, req).await;
    assert!(
        listing
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f["fileId"] == file_id.as_str() && f["originalFilename"] == "out.csv")
    );
}

#[actix_web::test]
async fn test_exec_with_uploaded_input() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = upload_request("input.csv", b"x\n1\n", Some("sess-in"))
        .insert_header(("user-id", "carol"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let file_id = body["files"][0]["fileId"].as_str().unwrap().to_string();

    // Session comes from the file reference; owner from the session index
    let req = exec_request(json!({
        "lang": "py",
        "code": "print(1+1)",
        "files": [{ "id": file_id, "name": "input.csv", "session_id": "sess-in" }],
    }))
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_json_include!(
        actual: body,
        expected: json!({ "session_id": "sess-in", "exitCode": 0, "files": [] })
    );

    let execs = env.audit_by_action("exec").await;
    assert_eq!(execs[0].user_id, "carol");
}

#[actix_web::test]
async fn test_exec_rejects_malicious_input_name() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = upload_request("input.csv", b"x", Some("sess-bad")).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let file_id = body["files"][0]["fileId"].as_str().unwrap().to_string();

    let req = exec_request(json!({
        "lang": "py",
        "code": "print(1+1)",
        "session_id": "sess-bad",
        "files": [{ "id": file_id, "name": "../../escape.csv" }],
    }))
    .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!env.storage_root.join("escape.csv").exists());
}

#[actix_web::test]
async fn test_exec_requires_lang_and_code() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = exec_request(json!({ "code": "print(1+1)" })).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body,
        expected: json!({ "reason": "ERR_INVALID_ARGUMENT", "message": "lang and code are required" })
    );

    let req = exec_request(json!({ "lang": "py", "code": "" })).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    assert_eq!(env.state.queue.stats().total, 0);
    let execs = env.audit_by_action("exec").await;
    assert_eq!(execs.len(), 2);
    assert!(execs.iter().all(|r| r.status == "error"));
}

#[actix_web::test]
async fn test_concurrent_execs_all_complete() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let requests = (0..5).map(|i| {
        let req = exec_request(json!({
            "lang": "py",
            "code": "print(1+1)",
            "session_id": format!("sess-{i}"),
        }))
        .to_request();
        test::call_service(&app, req)
    });
    let responses = futures_util::future::join_all(requests).await;
    assert!(responses.iter().all(|r| r.status() == StatusCode::OK));

    let stats = env.state.queue.stats();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.queued, 0);
}

#[actix_web::test]
async fn test_extract_pdf() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = upload_request("report.pdf", b"%PDF-1.4 fake", Some("sess-pdf")).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let file_id = body["files"][0]["fileId"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/extract-pdf")
        .set_json(json!({ "file_id": file_id, "session_id": "sess-pdf" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(
        actual: body,
        expected: json!({
            "success": true,
            "text": "--- Page 1 ---\nQuarterly report",
            "pageCount": 1,
            "metadata": { "title": "Report" },
            "queueInfo": { "wasQueued": false, "queuePosition": 0 },
        })
    );
    assert_eq!(env.state.queue.stats().completed, 1);
}

#[actix_web::test]
async fn test_extract_pdf_rejects_bad_requests() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = upload_request("notes.txt", b"plain", Some("sess-pdf")).to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let file_id = body["files"][0]["fileId"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/extract-pdf")
        .set_json(json!({ "file_id": file_id, "session_id": "sess-pdf" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/extract-pdf")
        .set_json(json!({ "session_id": "sess-pdf" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

    let req = test::TestRequest::post()
        .uri("/extract-pdf")
        .set_json(json!({ "file_id": "missing", "session_id": "sess-pdf" }))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);

    assert_eq!(env.state.queue.stats().total, 0);
}

#[actix_web::test]
async fn test_extract_pdf_ignores_generated_files() {
    let env = TestEnv::new("").await;
    let app = test::init_service(App::new().configure(configure_app(env.state.clone()))).await;

    let req = exec_request(json!({
        "lang": "py",
        "code": "open('chart.pdf', 'wb').write(render())",
        "session_id": "sess-gen",
    }))
    .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["files"][0]["name"], "chart.pdf");
    let file_id = body["files"][0]["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri("/extract-pdf")
        .set_json(json!({ "file_id": file_id, "session_id": "sess-gen" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert_json_include!(actual: body, expected: json!({ "reason": "ERR_NOT_FOUND", "code": 3 }));

    // Only the exec itself went through the queue
    assert_eq!(env.state.queue.stats().total, 1);
}

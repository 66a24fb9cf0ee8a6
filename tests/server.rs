mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::{json, Value};

use common::*;
use verifying_paymaster::rpc::paymaster_dispatcher;
use verifying_paymaster::server::{router, AppState};
use verifying_paymaster::server::authorize;
use verifying_paymaster::store::{ApiKeyStore, SledStore, StoreError};
use verifying_paymaster::types::ApiKey;

const KEY: &str = "test-key";

async fn create_test_server() -> (TestServer, Harness) {
    let h = harness();
    let keys = SledStore::temporary().unwrap();
    keys.put_api_key(&ApiKey {
        key: KEY.to_string(),
        enabled: true,
        label: "tests".to_string(),
    })
    .await
    .unwrap();
    keys.put_api_key(&ApiKey {
        key: "revoked".to_string(),
        enabled: false,
        label: String::new(),
    })
    .await
    .unwrap();

    let dispatcher = Arc::new(paymaster_dispatcher(h.paymaster.clone()).unwrap());
    let app = router(AppState {
        dispatcher,
        api_keys: Arc::new(keys),
        key_timeout: Duration::from_secs(5),
    });
    (TestServer::new(app).unwrap(), h)
}

fn call(id: u64, method: &str, params: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
}

async fn rpc(server: &TestServer, body: Value) -> Value {
    let response = server.post(&format!("/{KEY}")).json(&body).await;
    response.assert_status_ok();
    response.json()
}

#[tokio::test]
async fn health_needs_no_key() {
    let (server, _) = create_test_server().await;
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn gate_rejects_missing_unknown_and_disabled_keys() {
    let (server, _) = create_test_server().await;
    let body = call(1, "pm_config", json!([]));

    for path in ["/", "/nope", "/revoked"] {
        let response = server.post(path).json(&body).await;
        response.assert_status_ok();
        let resp: Value = response.json();
        assert_eq!(resp["error"]["code"], -32700, "path {path}");
        assert!(resp.get("result").is_none());
    }

    let resp: Value = server.post("/revoked").json(&body).await.json();
    assert_eq!(resp["error"]["message"], "Key error");
    assert_eq!(resp["error"]["data"], "Apikey error");
}

/// Key store whose lookups never complete.
struct StalledKeys;

#[async_trait]
impl ApiKeyStore for StalledKeys {
    async fn find_key(&self, _key: &str) -> Result<Option<ApiKey>, StoreError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stalled_key_lookup_is_a_database_error() {
    let err = authorize(&StalledKeys, KEY, Duration::from_millis(50))
        .await
        .unwrap_err();
    let body = serde_json::to_value(&err).unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["error"]["message"], "Database error");
    assert_eq!(body["error"]["data"], "Query apikey error");
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn transport_errors_use_parse_error() {
    let (server, _) = create_test_server().await;

    let resp: Value = server.get(&format!("/{KEY}")).await.json();
    assert_eq!(resp["error"]["code"], -32700);
    assert_eq!(resp["error"]["data"], "POST method excepted");

    let resp: Value = server.post(&format!("/{KEY}")).await.json();
    assert_eq!(resp["error"]["data"], "No POST data");

    let resp: Value = server
        .post(&format!("/{KEY}"))
        .text("{\"jsonrpc\":")
        .await
        .json();
    assert_eq!(resp["error"]["code"], -32700);
    assert_eq!(resp["id"], Value::Null);
}

#[tokio::test]
async fn unknown_address_has_no_gas() {
    let (server, _) = create_test_server().await;
    let resp = rpc(&server, call(7, "pm_gasRemain", json!([SENDER]))).await;
    assert_eq!(
        resp,
        json!({
            "jsonrpc": "2.0",
            "id": 7,
            "result": { "remain": "0", "last_request": 0, "total_used": "0" }
        })
    );
}

#[tokio::test]
async fn config_is_served_case_insensitively() {
    let (server, _) = create_test_server().await;
    let resp = rpc(&server, call(1, "PM_CONFIG", json!([]))).await;
    assert_eq!(
        resp["result"],
        json!({ "max_gas": "2000000", "vip_contract": VIP_CONTRACT, "max_vip_gas": "3000000" })
    );
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let (server, _) = create_test_server().await;
    let resp = rpc(&server, call(2, "pm_supportedEntryPoints", json!([]))).await;
    assert_eq!(resp["error"]["code"], -32601);
    assert_eq!(resp["id"], 2);
}

#[tokio::test]
async fn wrongly_typed_param_names_its_index() {
    let (server, _) = create_test_server().await;
    let resp = rpc(&server, call(3, "pm_gasRemain", json!([42]))).await;
    assert_eq!(resp["error"]["code"], -32602);
    assert_eq!(resp["error"]["data"], "Param [0] can't be converted to string");

    let resp = rpc(&server, call(3, "pm_gasRemain", json!(["not-an-address"]))).await;
    assert_eq!(resp["error"]["code"], -32602);

    let resp = rpc(
        &server,
        call(4, "pm_sponsorUserOperation", json!(["not a map", DEFAULT_EP])),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32602);
    assert_eq!(resp["error"]["data"], "Param [0] can't be converted to map");
}

const DEFAULT_EP: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";

#[tokio::test]
async fn request_then_sponsor() {
    let (server, h) = create_test_server().await;

    let resp = rpc(&server, call(1, "pm_requestGas", json!([SENDER]))).await;
    assert_eq!(resp["result"], true);

    let resp = rpc(
        &server,
        call(2, "pm_sponsorUserOperation", json!([user_op(SENDER, "0x1"), DEFAULT_EP])),
    )
    .await;
    let result = &resp["result"];
    assert_eq!(result["preVerificationGas"], "0xcc50");
    assert_eq!(result["verificationGasLimit"], "0x0186a0");
    assert_eq!(result["callGasLimit"], "0x814c");
    let data = result["paymasterAndData"].as_str().unwrap();
    assert!(data.starts_with(PAYMASTER));
    assert_eq!(data.len(), 2 + 2 * (20 + 64 + 65));

    let resp = rpc(&server, call(3, "pm_gasRemain", json!([SENDER]))).await;
    let remaining = 1_000_000 - FIXED_GAS;
    assert_eq!(resp["result"]["remain"], remaining.to_string());
    assert_eq!(resp["result"]["total_used"], FIXED_GAS.to_string());
    assert_eq!(h.chain.hashed.lock().unwrap().len(), 1);

    // Second grant inside the window is refused with a stable code.
    let resp = rpc(&server, call(4, "pm_requestGas", json!([SENDER]))).await;
    assert_eq!(resp["error"]["code"], -32003);
    assert_eq!(resp["error"]["message"], "frequent requests");
}

#[tokio::test]
async fn insufficient_gas_is_a_well_formed_error() {
    let (server, _) = create_test_server().await;
    let resp = rpc(
        &server,
        call(5, "pm_sponsorUserOperation", json!([user_op(SENDER, "0x1"), DEFAULT_EP])),
    )
    .await;
    assert_eq!(
        resp,
        json!({
            "jsonrpc": "2.0",
            "id": 5,
            "error": { "code": -32001, "message": "insufficient gas", "data": "insufficient gas" }
        })
    );
}

//! Thin JSON adapter mapping external commands onto the engine.
//!
//! Every inbound command is audited as a UserCommand before it runs; errors
//! additionally produce an ErrorEvent and map onto BadRequest or
//! InternalError via the error taxonomy. Response bodies are empty except
//! for QUOTE, DISPLAY_SUMMARY and DUMPLOG.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::money::Cents;

type ApiResult = Result<Response, (StatusCode, Json<Value>)>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/quote", post(quote))
        .route("/add", post(add))
        .route("/buy", post(buy))
        .route("/commitBuy", post(commit_buy))
        .route("/cancelBuy", post(cancel_buy))
        .route("/sell", post(sell))
        .route("/commitSell", post(commit_sell))
        .route("/cancelSell", post(cancel_sell))
        .route("/setBuyAmount", post(set_buy_amount))
        .route("/setBuyTrigger", post(set_buy_trigger))
        .route("/cancelSetBuy", post(cancel_set_buy))
        .route("/setSellAmount", post(set_sell_amount))
        .route("/setSellTrigger", post(set_sell_trigger))
        .route("/cancelSetSell", post(cancel_set_sell))
        .route("/displaySummary", post(display_summary))
        .route("/dumpLog", post(dump_log))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

// Request shapes shared by the commands.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRequest {
    user_id: String,
    transaction_num: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolRequest {
    user_id: String,
    stock_symbol: String,
    transaction_num: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AmountRequest {
    user_id: String,
    amount: Cents,
    transaction_num: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolAmountRequest {
    user_id: String,
    stock_symbol: String,
    amount: Cents,
    transaction_num: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DumpLogRequest {
    user_id: String,
    file_name: String,
    transaction_num: i64,
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "transaction-engine"
    }))
}

fn fail(
    state: &AppState,
    command: &str,
    user: &str,
    symbol: &str,
    err: EngineError,
    transaction_num: i64,
) -> (StatusCode, Json<Value>) {
    state
        .engine
        .audit()
        .error_event(command, user, symbol, &err.to_string(), transaction_num);
    (err.status(), Json(json!({ "error": err.to_string() })))
}

fn ok() -> Response {
    StatusCode::OK.into_response()
}

async fn quote(State(state): State<AppState>, Json(req): Json<SymbolRequest>) -> ApiResult {
    state.engine.audit().user_command(
        "QUOTE",
        &req.user_id,
        &req.stock_symbol,
        "",
        0,
        req.transaction_num,
    );
    match state
        .engine
        .quote(&req.user_id, &req.stock_symbol, req.transaction_num)
        .await
    {
        Ok(quote) => Ok(Json(json!(quote)).into_response()),
        Err(err) => Err(fail(
            &state,
            "QUOTE",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn add(State(state): State<AppState>, Json(req): Json<AmountRequest>) -> ApiResult {
    state
        .engine
        .audit()
        .user_command("ADD", &req.user_id, "", "", req.amount, req.transaction_num);
    match state
        .engine
        .add_funds(&req.user_id, req.amount, req.transaction_num)
        .await
    {
        Ok(_) => Ok(ok()),
        Err(err) => Err(fail(&state, "ADD", &req.user_id, "", err, req.transaction_num)),
    }
}

async fn buy(State(state): State<AppState>, Json(req): Json<SymbolAmountRequest>) -> ApiResult {
    state.engine.audit().user_command(
        "BUY",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .buy(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "BUY",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn commit_buy(State(state): State<AppState>, Json(req): Json<UserRequest>) -> ApiResult {
    state
        .engine
        .audit()
        .user_command("COMMIT_BUY", &req.user_id, "", "", 0, req.transaction_num);
    match state
        .engine
        .commit_buy(&req.user_id, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "COMMIT_BUY",
            &req.user_id,
            "",
            err,
            req.transaction_num,
        )),
    }
}

async fn cancel_buy(State(state): State<AppState>, Json(req): Json<UserRequest>) -> ApiResult {
    state
        .engine
        .audit()
        .user_command("CANCEL_BUY", &req.user_id, "", "", 0, req.transaction_num);
    match state
        .engine
        .cancel_buy(&req.user_id, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "CANCEL_BUY",
            &req.user_id,
            "",
            err,
            req.transaction_num,
        )),
    }
}

async fn sell(State(state): State<AppState>, Json(req): Json<SymbolAmountRequest>) -> ApiResult {
    state.engine.audit().user_command(
        "SELL",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .sell(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "SELL",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn commit_sell(State(state): State<AppState>, Json(req): Json<UserRequest>) -> ApiResult {
    state
        .engine
        .audit()
        .user_command("COMMIT_SELL", &req.user_id, "", "", 0, req.transaction_num);
    match state
        .engine
        .commit_sell(&req.user_id, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "COMMIT_SELL",
            &req.user_id,
            "",
            err,
            req.transaction_num,
        )),
    }
}

async fn cancel_sell(State(state): State<AppState>, Json(req): Json<UserRequest>) -> ApiResult {
    state
        .engine
        .audit()
        .user_command("CANCEL_SELL", &req.user_id, "", "", 0, req.transaction_num);
    match state
        .engine
        .cancel_sell(&req.user_id, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "CANCEL_SELL",
            &req.user_id,
            "",
            err,
            req.transaction_num,
        )),
    }
}

async fn set_buy_amount(
    State(state): State<AppState>,
    Json(req): Json<SymbolAmountRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "SET_BUY_AMOUNT",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .set_buy_amount(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "SET_BUY_AMOUNT",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn set_buy_trigger(
    State(state): State<AppState>,
    Json(req): Json<SymbolAmountRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "SET_BUY_TRIGGER",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .set_buy_trigger(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "SET_BUY_TRIGGER",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn cancel_set_buy(
    State(state): State<AppState>,
    Json(req): Json<SymbolRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "CANCEL_SET_BUY",
        &req.user_id,
        &req.stock_symbol,
        "",
        0,
        req.transaction_num,
    );
    match state
        .engine
        .cancel_set_buy(&req.user_id, &req.stock_symbol, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "CANCEL_SET_BUY",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn set_sell_amount(
    State(state): State<AppState>,
    Json(req): Json<SymbolAmountRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "SET_SELL_AMOUNT",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .set_sell_amount(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "SET_SELL_AMOUNT",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn set_sell_trigger(
    State(state): State<AppState>,
    Json(req): Json<SymbolAmountRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "SET_SELL_TRIGGER",
        &req.user_id,
        &req.stock_symbol,
        "",
        req.amount,
        req.transaction_num,
    );
    match state
        .engine
        .set_sell_trigger(&req.user_id, &req.stock_symbol, req.amount, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "SET_SELL_TRIGGER",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn cancel_set_sell(
    State(state): State<AppState>,
    Json(req): Json<SymbolRequest>,
) -> ApiResult {
    state.engine.audit().user_command(
        "CANCEL_SET_SELL",
        &req.user_id,
        &req.stock_symbol,
        "",
        0,
        req.transaction_num,
    );
    match state
        .engine
        .cancel_set_sell(&req.user_id, &req.stock_symbol, req.transaction_num)
        .await
    {
        Ok(()) => Ok(ok()),
        Err(err) => Err(fail(
            &state,
            "CANCEL_SET_SELL",
            &req.user_id,
            &req.stock_symbol,
            err,
            req.transaction_num,
        )),
    }
}

async fn display_summary(State(state): State<AppState>, Json(req): Json<UserRequest>) -> ApiResult {
    state.engine.audit().user_command(
        "DISPLAY_SUMMARY",
        &req.user_id,
        "",
        "",
        0,
        req.transaction_num,
    );
    match state
        .engine
        .display_summary(&req.user_id, req.transaction_num)
        .await
    {
        Ok(funds) => Ok(Json(json!({ "funds": funds })).into_response()),
        Err(err) => Err(fail(
            &state,
            "DISPLAY_SUMMARY",
            &req.user_id,
            "",
            err,
            req.transaction_num,
        )),
    }
}

async fn dump_log(State(state): State<AppState>, Json(req): Json<DumpLogRequest>) -> ApiResult {
    state.engine.audit().user_command(
        "DUMPLOG",
        &req.user_id,
        "",
        &req.file_name,
        0,
        req.transaction_num,
    );
    if req.file_name.is_empty() {
        let err = EngineError::Validation("filename must not be empty".to_string());
        return Err(fail(&state, "DUMPLOG", &req.user_id, "", err, req.transaction_num));
    }
    match state.engine.audit().dump_log(&req.file_name).await {
        Ok(ack) => Ok(Json(ack).into_response()),
        Err(err) => Err(fail(&state, "DUMPLOG", &req.user_id, "", err, req.transaction_num)),
    }
}

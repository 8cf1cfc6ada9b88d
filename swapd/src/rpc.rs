//! Status and control HTTP API. Mutating endpoints never touch swap state
//! directly: refund requests are enqueued on the owning driver's input
//! channel and offer actions go through the protocol instances.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::Backend;
use crate::db::SwapStore;
use crate::driver::{Shutdown, SwapEvent};
use crate::error::{Result, SwapError};
use crate::maker::{Maker, Offer};
use crate::manager::SwapManager;
use crate::net::PeerId;
use crate::state::{Asset, Swap, SwapRole, SwapState};
use crate::taker::Taker;

/// Offer publication, erased over the backend type.
#[async_trait]
pub trait MakerApi: Send + Sync {
    async fn publish_offer(&self, xmr_amount: u128, eth_amount: u128, tolerance_bps: u32)
        -> Result<Offer>;
}

#[async_trait]
impl<B: Backend + 'static> MakerApi for Maker<B> {
    async fn publish_offer(
        &self,
        xmr_amount: u128,
        eth_amount: u128,
        tolerance_bps: u32,
    ) -> Result<Offer> {
        self.make_offer(xmr_amount, eth_amount, tolerance_bps)
    }
}

/// Offer taking, erased over the backend type.
#[async_trait]
pub trait TakerApi: Send + Sync {
    async fn take(&self, peer: PeerId, offer: Offer) -> Result<String>;
}

#[async_trait]
impl<B: Backend + 'static> TakerApi for Taker<B> {
    async fn take(&self, peer: PeerId, offer: Offer) -> Result<String> {
        self.take_offer(peer, offer).await
    }
}

#[derive(Clone)]
pub struct RpcState {
    pub manager: Arc<SwapManager>,
    pub store: SwapStore,
    pub maker: Arc<dyn MakerApi>,
    pub taker: Arc<dyn TakerApi>,
}

/// Public view of a swap record; secret material is never exposed.
#[derive(Serialize)]
struct SwapStatus {
    offer_id: String,
    role: SwapRole,
    peer: String,
    state: SwapState,
    provides: Asset,
    provided_amount: u128,
    desired_amount: u128,
    timeout_1: Option<u64>,
    timeout_2: Option<u64>,
    contract_swap_id: Option<String>,
    eth_lock_tx: Option<String>,
    eth_final_tx: Option<String>,
    xmr_lock_tx: Option<String>,
    xmr_final_tx: Option<String>,
    joint_address: Option<String>,
}

impl From<Swap> for SwapStatus {
    fn from(swap: Swap) -> Self {
        Self {
            offer_id: swap.offer_id,
            role: swap.role,
            peer: swap.peer,
            state: swap.state,
            provides: swap.provides,
            provided_amount: swap.provided_amount,
            desired_amount: swap.desired_amount,
            timeout_1: swap.timeout_1,
            timeout_2: swap.timeout_2,
            contract_swap_id: swap.contract_swap_id,
            eth_lock_tx: swap.eth_lock_tx,
            eth_final_tx: swap.eth_final_tx,
            xmr_lock_tx: swap.xmr_lock_tx,
            xmr_final_tx: swap.xmr_final_tx,
            joint_address: swap.joint_address,
        }
    }
}

#[derive(Deserialize)]
struct MakeOfferRequest {
    xmr_amount: u128,
    eth_amount: u128,
    #[serde(default = "default_tolerance")]
    tolerance_bps: u32,
}

fn default_tolerance() -> u32 {
    100
}

#[derive(Deserialize)]
struct TakeRequest {
    peer: String,
    offer: Offer,
}

#[derive(Serialize)]
struct TakeResponse {
    offer_id: String,
}

pub fn router(state: RpcState) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/swaps", get(list_swaps))
        .route("/swap/:id", get(swap_status))
        .route("/swap/:id/refund", post(request_refund))
        .route("/offers", post(make_offer))
        .route("/take", post(take_offer))
        .with_state(state)
}

pub async fn serve(bind: &str, state: RpcState, mut shutdown: Shutdown) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "RPC server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn list_swaps(State(state): State<RpcState>) -> Json<Vec<String>> {
    Json(state.manager.active_ids())
}

async fn swap_status(
    State(state): State<RpcState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<SwapStatus>, StatusCode> {
    let swap = state
        .store
        .load_swap(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(SwapStatus::from(swap)))
}

async fn request_refund(
    State(state): State<RpcState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.manager.get(&id) {
        Some(handle) => {
            if handle.input.send(SwapEvent::RefundRequested).await.is_ok() {
                StatusCode::ACCEPTED
            } else {
                StatusCode::GONE
            }
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn make_offer(
    State(state): State<RpcState>,
    Json(request): Json<MakeOfferRequest>,
) -> std::result::Result<Json<Offer>, StatusCode> {
    state
        .maker
        .publish_offer(request.xmr_amount, request.eth_amount, request.tolerance_bps)
        .await
        .map(Json)
        .map_err(error_status)
}

async fn take_offer(
    State(state): State<RpcState>,
    Json(request): Json<TakeRequest>,
) -> std::result::Result<Json<TakeResponse>, StatusCode> {
    state
        .taker
        .take(request.peer, request.offer)
        .await
        .map(|offer_id| Json(TakeResponse { offer_id }))
        .map_err(error_status)
}

fn error_status(err: SwapError) -> StatusCode {
    match err {
        SwapError::BadInput(_) => StatusCode::BAD_REQUEST,
        SwapError::AlreadyActive => StatusCode::CONFLICT,
        SwapError::PeerGone => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

use async_trait::async_trait;
use server_api::{dispatch, AdminSuccession, ApiContext};
use shared::{
    domain::UserId,
    protocol::{RpcRequest, RpcResponse},
};
use storage::Storage;

use super::{Transport, TransportError};

/// Secondary transport: runs the backend procedures against the store
/// in-process, with the same authorization rules as the RPC server.
pub struct DirectStoreTransport {
    ctx: ApiContext,
}

impl DirectStoreTransport {
    pub fn new(storage: Storage, admin_succession: AdminSuccession) -> Self {
        Self {
            ctx: ApiContext {
                storage,
                admin_succession,
            },
        }
    }

    pub async fn open(
        database_url: &str,
        admin_succession: AdminSuccession,
    ) -> anyhow::Result<Self> {
        let storage = Storage::new(database_url).await?;
        Ok(Self::new(storage, admin_succession))
    }

    pub fn storage(&self) -> &Storage {
        &self.ctx.storage
    }
}

#[async_trait]
impl Transport for DirectStoreTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn call(
        &self,
        user_id: UserId,
        request: RpcRequest,
    ) -> Result<RpcResponse, TransportError> {
        dispatch(&self.ctx, user_id, request)
            .await
            .map_err(TransportError::Api)
    }

    async fn health(&self) -> Result<(), TransportError> {
        self.ctx
            .storage
            .health_check()
            .await
            .map_err(|e| TransportError::unavailable(format!("{e:#}")))
    }
}

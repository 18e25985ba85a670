use super::stamp_created_at;
use async_trait::async_trait;
use resource_framework::cancel::CancellationToken;
use resource_framework::definition::{ResourceDefinition, WriteOperationKind};
use resource_framework::error::HookError;
use resource_framework::resource::Resource;

pub struct CommentDefinition;

#[async_trait]
impl ResourceDefinition for CommentDefinition {
    async fn on_prepare_write(
        &self,
        resource: &mut Resource,
        kind: WriteOperationKind,
        _cancel: &CancellationToken,
    ) -> Result<(), HookError> {
        if kind == WriteOperationKind::CreateResource {
            stamp_created_at(resource);
        }
        Ok(())
    }
}

//! Node service: translates CSI requests for the volume manager.

use std::sync::Arc;

use confsync::node::{PublishVolume, StageVolume, UnpublishVolume, UnstageVolume};
use confsync::VolumeManager;
use tonic::{Request, Response, Status};

use super::csi::node_server::Node;
use super::csi::node_service_capability::{self, rpc};
use super::csi::{
    NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
    NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
    NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
};
use super::{capability_from_wire, to_status};

/// Node service backed by a [`VolumeManager`].
#[derive(Debug, Clone)]
pub struct NodeService {
    manager: Arc<VolumeManager>,
}

impl NodeService {
    /// Create a new node service.
    pub const fn new(manager: Arc<VolumeManager>) -> Self {
        Self { manager }
    }
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.manager
            .stage_volume(StageVolume {
                volume_capability: req.volume_capability.as_ref().map(capability_from_wire),
                volume_id: req.volume_id,
                staging_target_path: req.staging_target_path,
                volume_context: req.volume_context,
                secrets: req.secrets,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.manager
            .unstage_volume(UnstageVolume {
                volume_id: req.volume_id,
                staging_target_path: req.staging_target_path,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.manager
            .publish_volume(PublishVolume {
                volume_capability: req.volume_capability.as_ref().map(capability_from_wire),
                volume_id: req.volume_id,
                target_path: req.target_path,
                staging_target_path: req.staging_target_path,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.manager
            .unpublish_volume(UnpublishVolume {
                volume_id: req.volume_id,
                target_path: req.target_path,
            })
            .await
            .map_err(to_status)?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(node_service_capability::Type::Rpc(
                    node_service_capability::Rpc {
                        r#type: rpc::Type::StageUnstageVolume.into(),
                    },
                )),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.manager.config().node_id.clone(),
            max_volumes_per_node: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::grpc::csi::volume_capability::{self, access_mode::Mode};
    use confsync::filesystem::HostMounts;
    use confsync::worker::{SyncWorker, WorkerFactory};
    use confsync::{NodeConfig, VolumeRecord};
    use confsync_common::{ConfsyncError, ConfsyncResult};
    use tonic::Code;

    fn service(dir: &std::path::Path) -> NodeService {
        let factory = |_: &VolumeRecord| -> ConfsyncResult<Arc<dyn SyncWorker>> {
            Err(ConfsyncError::internal("no workers in this test"))
        };
        let manager = VolumeManager::new(
            NodeConfig {
                node_id: "node-7".into(),
                state_file: dir.join("state.json"),
                allow_single_writer: false,
            },
            Arc::new(HostMounts),
            Arc::new(factory) as Arc<dyn WorkerFactory>,
        )
        .unwrap();
        NodeService::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn info_and_capabilities() {
        let temp = tempfile::tempdir().unwrap();
        let service = service(temp.path());

        let info = service
            .node_get_info(Request::new(NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "node-7");

        let caps = service
            .node_get_capabilities(Request::new(NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 1);
        let Some(node_service_capability::Type::Rpc(cap)) = &caps.capabilities[0].r#type else {
            panic!("expected an RPC capability");
        };
        assert_eq!(cap.r#type(), rpc::Type::StageUnstageVolume);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let temp = tempfile::tempdir().unwrap();
        let service = service(temp.path());

        let status = service
            .node_stage_volume(Request::new(NodeStageVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "VolumeId missing in request");

        let status = service
            .node_publish_volume(Request::new(NodePublishVolumeRequest {
                volume_id: "v1".into(),
                target_path: temp.path().join("target").to_string_lossy().into_owned(),
                volume_capability: Some(crate::grpc::csi::VolumeCapability {
                    access_type: Some(volume_capability::AccessType::Mount(
                        volume_capability::MountVolume::default(),
                    )),
                    access_mode: Some(volume_capability::AccessMode {
                        mode: Mode::MultiNodeReaderOnly.into(),
                    }),
                }),
                staging_target_path: String::new(),
                publish_context: HashMap::new(),
                readonly: true,
                secrets: HashMap::new(),
                volume_context: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::FailedPrecondition);

        // Unstaging something never staged is a no-op.
        service
            .node_unstage_volume(Request::new(NodeUnstageVolumeRequest {
                volume_id: "v1".into(),
                staging_target_path: "/nonexistent/stage".into(),
            }))
            .await
            .unwrap();

        let status = service
            .node_expand_volume(Request::new(NodeExpandVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unimplemented);
    }
}

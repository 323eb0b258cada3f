//! Controller service.
//!
//! Volumes have no backing storage, so creation only validates the request
//! and templates the volume context; nothing is persisted here.

use confsync::volume::{read_volume_capability, read_volume_context};
use confsync_common::ConfsyncResult;
use tonic::{Request, Response, Status};

use super::csi::controller_server::Controller;
use super::csi::controller_service_capability::{self, rpc};
use super::csi::validate_volume_capabilities_response::Confirmed;
use super::csi::{
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerPublishVolumeRequest, ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, ControllerUnpublishVolumeResponse, CreateVolumeRequest,
    CreateVolumeResponse, DeleteVolumeRequest, DeleteVolumeResponse, GetCapacityRequest,
    GetCapacityResponse, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse,
    Volume, VolumeCapability,
};
use super::{capability_from_wire, to_status};

/// Parameter set by the external provisioner with the claim name.
pub const PVC_NAME_PARAM: &str = "csi.storage.k8s.io/pvc/name";
/// Parameter set by the external provisioner with the claim namespace.
pub const PVC_NAMESPACE_PARAM: &str = "csi.storage.k8s.io/pvc/namespace";
/// Parameter set by the external provisioner with the volume name.
pub const PV_NAME_PARAM: &str = "csi.storage.k8s.io/pv/name";

/// Stateless controller.
#[derive(Debug, Clone)]
pub struct ControllerService {
    allow_single_writer: bool,
}

impl ControllerService {
    /// Create a new controller service.
    pub const fn new(allow_single_writer: bool) -> Self {
        Self {
            allow_single_writer,
        }
    }

    fn check_capabilities(&self, caps: &[VolumeCapability]) -> ConfsyncResult<()> {
        for cap in caps {
            read_volume_capability(Some(&capability_from_wire(cap)), self.allow_single_writer)?;
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(name = %req.name, "CreateVolume");

        if req.name.is_empty() {
            return Err(Status::invalid_argument("Name missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "VolumeCapabilities missing in request",
            ));
        }
        self.check_capabilities(&req.volume_capabilities)
            .map_err(to_status)?;

        let capacity_bytes = req.capacity_range.map_or(0, |r| r.required_bytes);
        let mut context = read_volume_context(&req.parameters).map_err(to_status)?;
        context.expand_variables(|name| {
            let param = match name {
                "pvc.name" => PVC_NAME_PARAM,
                "pvc.namespace" => PVC_NAMESPACE_PARAM,
                "pv.name" => PV_NAME_PARAM,
                _ => return None,
            };
            req.parameters.get(param).cloned()
        });

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(Volume {
                capacity_bytes,
                volume_id: req.name,
                volume_context: context.to_parameters(),
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(volume_id = %req.volume_id, "DeleteVolume");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("VolumeId missing in request"));
        }
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(volume_id = %req.volume_id, "ValidateVolumeCapabilities");

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("VolumeId missing in request"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument(
                "VolumeCapabilities missing in request",
            ));
        }

        let confirmed = self
            .check_capabilities(&req.volume_capabilities)
            .and_then(|()| read_volume_context(&req.volume_context))
            .and_then(|context| Ok((context, read_volume_context(&req.parameters)?)));

        let response = match confirmed {
            Ok((context, parameters)) => ValidateVolumeCapabilitiesResponse {
                confirmed: Some(Confirmed {
                    volume_context: context.to_parameters(),
                    volume_capabilities: req.volume_capabilities,
                    parameters: parameters.to_parameters(),
                }),
                message: String::new(),
            },
            Err(e) => ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.to_string(),
            },
        };
        Ok(Response::new(response))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Err(Status::unimplemented(""))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![ControllerServiceCapability {
                r#type: Some(controller_service_capability::Type::Rpc(
                    controller_service_capability::Rpc {
                        r#type: rpc::Type::CreateDeleteVolume.into(),
                    },
                )),
            }],
        }))
    }
}

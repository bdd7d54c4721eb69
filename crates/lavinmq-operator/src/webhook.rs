//! Validating admission webhook for LavinMQ resources
//!
//! Rejects specs that fail field validation and topology changes that
//! could lose messages. See [`crate::topology`].

use std::net::SocketAddr;
use std::path::Path;

use axum::{routing::post, Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use kube::ResourceExt;
use tracing::{debug, error, info, warn};
use validator::Validate;

use crate::crd::{LavinMQ, LavinMQSpec};
use crate::error::{OperatorError, Result};
use crate::topology;

/// Path the ValidatingWebhookConfiguration points at
pub const VALIDATE_PATH: &str = "/validate-cloudamqp-com-v1alpha1-lavinmq";

/// Router serving the validation endpoint
pub fn router() -> Router {
    Router::new().route(VALIDATE_PATH, post(validate_handler))
}

/// Handle a validating admission review for a LavinMQ resource
pub async fn validate_handler(
    Json(body): Json<AdmissionReview<LavinMQ>>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<LavinMQ> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let response = match admit(&req) {
        Ok(()) => {
            debug!(uid = %req.uid, operation = ?req.operation, name = %req.name, "Admitted");
            AdmissionResponse::from(&req)
        }
        Err(reason) => {
            warn!(
                uid = %req.uid,
                operation = ?req.operation,
                name = %req.name,
                reason = %reason,
                "Denied"
            );
            AdmissionResponse::from(&req).deny(reason)
        }
    };

    Json(response.into_review())
}

fn validate_spec(instance: &LavinMQ) -> std::result::Result<(), String> {
    instance
        .spec
        .validate()
        .map_err(|e| format!("invalid spec for {}: {}", instance.name_any(), e))
}

fn object(req: &AdmissionRequest<LavinMQ>) -> std::result::Result<&LavinMQ, String> {
    req.object
        .as_ref()
        .ok_or_else(|| "admission request carries no object".to_string())
}

fn check_topology(
    old: Option<&LavinMQSpec>,
    new: &LavinMQSpec,
) -> std::result::Result<(), String> {
    match old {
        Some(old) => topology::validate_update(old, new),
        None => topology::validate_create(new),
    }
    .map_err(|e| e.to_string())
}

/// Decide one admission request
fn admit(req: &AdmissionRequest<LavinMQ>) -> std::result::Result<(), String> {
    match req.operation {
        Operation::Create => {
            let new = object(req)?;
            validate_spec(new)?;
            check_topology(None, &new.spec)
        }
        Operation::Update => {
            let new = object(req)?;
            validate_spec(new)?;
            check_topology(req.old_object.as_ref().map(|o| &o.spec), &new.spec)
        }
        Operation::Delete | Operation::Connect => {
            topology::validate_delete().map_err(|e| e.to_string())
        }
    }
}

/// Serve the webhook until the server fails.
///
/// With `cert_dir` set, `tls.crt` and `tls.key` are loaded from it and the
/// endpoint is served over TLS, as the API server requires. Without it the
/// endpoint is served over plain HTTP for local runs.
pub async fn serve_webhook(addr: SocketAddr, cert_dir: Option<&Path>) -> Result<()> {
    let app = router();

    match cert_dir {
        Some(dir) => {
            let tls_config =
                RustlsConfig::from_pem_file(dir.join("tls.crt"), dir.join("tls.key"))
                    .await
                    .map_err(|e| {
                        OperatorError::InvalidConfig(format!(
                            "failed to load webhook certificates from {}: {}",
                            dir.display(),
                            e
                        ))
                    })?;

            info!(address = %addr, "Starting admission webhook (TLS)");
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .map_err(|e| OperatorError::Internal(format!("webhook server error: {}", e)))
        }
        None => {
            info!(address = %addr, "Starting admission webhook (plain HTTP)");
            let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
                OperatorError::InvalidConfig(format!("failed to bind webhook on {}: {}", addr, e))
            })?;
            axum::serve(listener, app)
                .await
                .map_err(|e| OperatorError::Internal(format!("webhook server error: {}", e)))
        }
    }
}

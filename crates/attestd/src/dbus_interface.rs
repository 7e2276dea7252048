use std::sync::Arc;

use tracing::Instrument;
use uuid::Uuid;
use zbus::interface;

use crate::engine::{Engine, EngineError};

pub const BUS_NAME: &str = "io.attest.Attest1";
pub const OBJECT_PATH: &str = "/io/attest/Attest1";

/// D-Bus front end for the verification engine.
///
/// Bus name: io.attest.Attest1
/// Object path: /io/attest/Attest1
pub struct AttestService {
    engine: Arc<Engine>,
}

impl AttestService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[interface(name = "io.attest.Attest1")]
impl AttestService {
    /// Enroll one or more photos of `user`. Returns `{"status":bool,"message":str}`.
    async fn enroll(&self, user: &str, images: Vec<Vec<u8>>) -> zbus::fdo::Result<String> {
        let span = request_span("enroll");
        async move {
            tracing::info!(user, images = images.len(), "enroll requested");
            let reply = self.engine.enroll(user, images).await.map_err(to_fdo)?;
            to_json(&reply)
        }
        .instrument(span)
        .await
    }

    /// Verify `user` performing `task` in one proof photo. Returns the decision as JSON.
    async fn verify(&self, user: &str, task: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        let span = request_span("verify");
        async move {
            tracing::info!(user, task, bytes = image.len(), "verify requested");
            let record = self.engine.verify(user, task, image).await.map_err(to_fdo)?;
            to_json(&record)
        }
        .instrument(span)
        .await
    }

    /// Enrolled users and their shot counts.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.engine.list_users().await.map_err(to_fdo)?;
        to_json(&users)
    }

    /// Delete everything stored for `user`.
    async fn forget(&self, user: &str) -> zbus::fdo::Result<bool> {
        self.engine.forget(user).await.map_err(to_fdo)
    }

    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.engine.status().to_string())
    }
}

/// Span carrying a short per-request id.
fn request_span(method: &'static str) -> tracing::Span {
    let id = Uuid::new_v4().simple().to_string();
    tracing::info_span!("request", method, id = &id[..8])
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    if err.is_invalid_input() {
        tracing::info!(error = %err, "rejected invalid request");
        zbus::fdo::Error::InvalidArgs(err.to_string())
    } else {
        tracing::error!(error = %err, "request failed");
        zbus::fdo::Error::Failed("internal error".into())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| {
        tracing::error!(error = %e, "reply serialization failed");
        zbus::fdo::Error::Failed("internal error".into())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_maps_to_invalid_args() {
        let err = to_fdo(EngineError::InvalidInput("username is required".into()));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(ref m) if m == "username is required"));
    }

    #[test]
    fn test_faults_do_not_leak_details() {
        let err = to_fdo(EngineError::Audit(std::io::Error::other("/secret/path: disk full")));
        assert!(matches!(err, zbus::fdo::Error::Failed(ref m) if m == "internal error"));
    }

    #[test]
    fn test_timeout_is_a_failure() {
        let err = to_fdo(EngineError::TimedOut(std::time::Duration::from_secs(10)));
        assert!(matches!(err, zbus::fdo::Error::Failed(ref m) if m == "internal error"));
    }
}

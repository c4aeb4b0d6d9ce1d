use crate::engine::{EngineError, EngineHandle};
use recall_core::{
    DetailsPatch, EnrollError, Filter, IdentifyOutcome, IdentityRecord, ImageInput,
    MemberDetails, Order, Relation, ServiceError,
};
use serde::Deserialize;
use serde_json::{json, Value};
use zbus::interface;

const UNAVAILABLE: &str = "temporarily unavailable, try again";

/// Static facts reported by `Status`.
pub struct DaemonInfo {
    pub workers: usize,
    pub acceptance_floor: f64,
    pub comparator: &'static str,
    pub sealed: bool,
}

/// D-Bus interface for the Recall identity daemon.
///
/// Bus name: org.recall.Recall1
/// Object path: /org/recall/Recall1
///
/// Every method takes the owning account first; structured arguments and
/// results are JSON strings. Profiles never carry embeddings.
pub struct RecallInterface {
    engine: EngineHandle,
    info: DaemonInfo,
}

impl RecallInterface {
    pub fn new(engine: EngineHandle, info: DaemonInfo) -> Self {
        Self { engine, info }
    }
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    name: String,
    /// `data:image/...;base64,` URL or a path readable by the daemon.
    image: String,
    #[serde(flatten)]
    details: MemberDetails,
}

#[derive(Debug, Default, Deserialize)]
struct ListRequest {
    #[serde(default)]
    relation: Option<Relation>,
    #[serde(default)]
    is_close: Option<bool>,
}

#[interface(name = "org.recall.Recall1")]
impl RecallInterface {
    /// Enroll a person from one photo plus descriptive details.
    async fn enroll(&self, account: &str, request: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let req: EnrollRequest = parse_json(request)?;
        let image = parse_image(&req.image)?;
        tracing::info!(account = %account, name = %req.name, "enroll requested");

        let record = self
            .engine
            .enroll(account, req.name, req.details, image)
            .await
            .map_err(to_fdo)?;
        Ok(json!({ "status": "enrolled", "member": record.profile() }).to_string())
    }

    /// Identify who is in a photo among the account's enrollments.
    async fn identify(&self, account: &str, image: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let image = parse_image(image)?;
        tracing::info!(account = %account, "identify requested");

        let outcome = self.engine.identify(account, image).await.map_err(to_fdo)?;
        Ok(outcome_json(&outcome).to_string())
    }

    /// List members, alphabetically. `filter` is `{"relation"?, "is_close"?}` or empty.
    async fn list_members(&self, account: &str, filter: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let req: ListRequest = if filter.trim().is_empty() {
            ListRequest::default()
        } else {
            parse_json(filter)?
        };
        let filter = Filter {
            relation: req.relation,
            is_close: req.is_close,
            name_contains: None,
            order: Order::Name,
        };
        let records = self.engine.list(account, filter).await.map_err(to_fdo)?;
        Ok(profiles_json(&records).to_string())
    }

    async fn search_members(&self, account: &str, query: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let records = self
            .engine
            .search(account, query.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(profiles_json(&records).to_string())
    }

    async fn get_member(&self, account: &str, id: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let result = self.engine.get(account, id.to_string()).await;
        member_or_not_found(result, "found")
    }

    /// Apply a partial update; `""` clears the optional notes fields.
    async fn update_member(
        &self,
        account: &str,
        id: &str,
        patch: &str,
    ) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        let patch: DetailsPatch = parse_json(patch)?;
        tracing::info!(account = %account, id, "update requested");
        let result = self.engine.update(account, id.to_string(), patch).await;
        member_or_not_found(result, "updated")
    }

    async fn remove_member(&self, account: &str, id: &str) -> zbus::fdo::Result<String> {
        let account = require_account(account)?;
        tracing::info!(account = %account, id, "remove requested");
        match self.engine.remove(account, id.to_string()).await {
            Ok(()) => Ok(json!({ "status": "removed", "id": id }).to_string()),
            Err(EngineError::Service(ServiceError::NotFound(_))) => {
                Ok(json!({ "status": "not_found", "id": id }).to_string())
            }
            Err(err) => Err(to_fdo(err)),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workers": self.info.workers,
            "acceptance_floor": self.info.acceptance_floor,
            "comparator": self.info.comparator,
            "embeddings_sealed": self.info.sealed,
        })
        .to_string())
    }
}

fn require_account(account: &str) -> zbus::fdo::Result<String> {
    let account = account.trim();
    if account.is_empty() {
        return Err(zbus::fdo::Error::InvalidArgs("account is required".into()));
    }
    Ok(account.to_string())
}

fn parse_json<T: serde::de::DeserializeOwned>(raw: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid request: {e}")))
}

fn parse_image(raw: &str) -> zbus::fdo::Result<ImageInput> {
    ImageInput::parse(raw).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn profiles_json(records: &[IdentityRecord]) -> Value {
    Value::Array(
        records
            .iter()
            .map(|r| json!(r.profile()))
            .collect(),
    )
}

fn member_or_not_found(
    result: Result<IdentityRecord, EngineError>,
    status: &str,
) -> zbus::fdo::Result<String> {
    match result {
        Ok(record) => Ok(json!({ "status": status, "member": record.profile() }).to_string()),
        Err(EngineError::Service(ServiceError::NotFound(id))) => {
            Ok(json!({ "status": "not_found", "id": id }).to_string())
        }
        Err(err) => Err(to_fdo(err)),
    }
}

fn outcome_json(outcome: &IdentifyOutcome) -> Value {
    match outcome {
        IdentifyOutcome::Identified {
            record,
            score,
            distance,
        } => json!({
            "status": "identified",
            "score": score,
            "distance": distance,
            "member": record.profile(),
        }),
        IdentifyOutcome::NoFaceDetected => json!({
            "status": "no_face_detected",
            "message": "No face detected in the image. Please try again with a clearer photo.",
        }),
        IdentifyOutcome::NoEnrollments => json!({
            "status": "no_enrollments",
            "message": "No people are enrolled for this account yet.",
        }),
        IdentifyOutcome::NoMatch { closest } => json!({
            "status": "no_match",
            "closest": closest,
            "message": "This person is not recognized.",
        }),
    }
}

/// Caller mistakes get an actionable `InvalidArgs`; anything else is
/// logged here and surfaced as a generic failure.
fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::Enroll(
            e @ (EnrollError::InvalidDetails(_)
            | EnrollError::NoFaceDetected
            | EnrollError::Duplicate { .. }),
        ) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        EngineError::Service(
            e @ (ServiceError::InvalidDetails(_)
            | ServiceError::Duplicate { .. }
            | ServiceError::NotFound(_)),
        ) => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => {
            tracing::warn!(error = %other, "request failed");
            zbus::fdo::Error::Failed(UNAVAILABLE.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use recall_core::{Embedding, NewIdentity, StoreError, EMBEDDING_DIM};

    fn record() -> IdentityRecord {
        IdentityRecord::from_new(
            NewIdentity {
                account_id: "u1".into(),
                name: "Rose".into(),
                details: MemberDetails {
                    relation: Relation::Sister,
                    mobile: "5551234".into(),
                    is_close: true,
                    address: "7 Pine Court".into(),
                    additional_info: None,
                    important_notes: Some("Bring tea".into()),
                },
                embedding: Embedding::from_values(vec![0.2; EMBEDDING_DIM]).unwrap(),
                image_ref: "sha256:ff".into(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_identified_json_has_profile_without_embedding() {
        let outcome = IdentifyOutcome::Identified {
            record: record(),
            score: 0.93,
            distance: 0.07,
        };
        let v = outcome_json(&outcome);
        assert_eq!(v["status"], "identified");
        assert_eq!(v["member"]["name"], "Rose");
        assert_eq!(v["member"]["relation"], "sister");
        assert_eq!(v["member"]["important_notes"], "Bring tea");
        assert!(v["member"].get("embedding").is_none());
    }

    #[test]
    fn test_outcome_statuses() {
        assert_eq!(outcome_json(&IdentifyOutcome::NoFaceDetected)["status"], "no_face_detected");
        assert_eq!(outcome_json(&IdentifyOutcome::NoEnrollments)["status"], "no_enrollments");
        assert_eq!(
            outcome_json(&IdentifyOutcome::NoMatch { closest: 0.3 })["status"],
            "no_match"
        );
    }

    #[test]
    fn test_enroll_request_shape() {
        let req: EnrollRequest = serde_json::from_str(
            r#"{"name": "Rose", "image": "/tmp/rose.jpg", "relation": "sister",
                "mobile": "5551234", "address": "7 Pine Court"}"#,
        )
        .unwrap();
        assert_eq!(req.name, "Rose");
        assert!(req.details.is_close);
        assert_eq!(req.details.relation, Relation::Sister);
    }

    #[test]
    fn test_error_mapping() {
        let dup = to_fdo(EngineError::Enroll(EnrollError::Duplicate { name: "Rose".into() }));
        assert!(matches!(dup, zbus::fdo::Error::InvalidArgs(ref m) if m.contains("Rose")));

        let infra = to_fdo(EngineError::Store(StoreError::Backend("disk on fire".into())));
        match infra {
            zbus::fdo::Error::Failed(msg) => {
                assert_eq!(msg, UNAVAILABLE);
                assert!(!msg.contains("disk"));
            }
            other => panic!("unexpected mapping: {other:?}"),
        }
        assert!(matches!(
            to_fdo(EngineError::ChannelClosed),
            zbus::fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_blank_account_rejected() {
        assert!(require_account("  ").is_err());
        assert_eq!(require_account(" u1 ").unwrap(), "u1");
    }
}

//! Request and response bodies of the identify operation.
//!
//! These are transport-neutral: the HTTP layer deserializes an
//! [`IdentifyRequest`], hands it to [`IdentityResolver::identify`] and
//! serializes the [`IdentifyResponse`].

use serde::{Deserialize, Deserializer, Serialize};

use crate::contact::{ConsolidatedContact, Identifiers};
use crate::error::{ReconcileResult, ValidationError};
use crate::resolver::IdentityResolver;

/// Body of an identify call.
///
/// `phoneNumber` may arrive as a JSON string or a JSON integer; both become
/// the decimal string. `null`, a missing key and `""` all mean absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    /// Email address.
    #[serde(default)]
    pub email: Option<String>,
    /// Phone number.
    #[serde(default, deserialize_with = "phone_number")]
    pub phone_number: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PhoneRepr {
    Text(String),
    Unsigned(u64),
    Signed(i64),
}

fn phone_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<PhoneRepr>::deserialize(deserializer)?.map(|repr| match repr {
        PhoneRepr::Text(s) => s,
        PhoneRepr::Unsigned(n) => n.to_string(),
        PhoneRepr::Signed(n) => n.to_string(),
    }))
}

impl IdentifyRequest {
    /// Convenience constructor.
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        }
    }

    /// Validate into an identifier pair.
    pub fn identifiers(&self) -> Result<Identifiers, ValidationError> {
        Identifiers::new(self.email.as_deref(), self.phone_number.as_deref())
    }
}

/// Body of a successful identify call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    /// The consolidated identity.
    pub contact: ConsolidatedContact,
}

impl IdentityResolver {
    /// Run the identify operation on a request body.
    pub fn identify(&self, request: &IdentifyRequest) -> ReconcileResult<IdentifyResponse> {
        let identifiers = request.identifiers()?;
        let contact = self.resolve_identifiers(&identifiers)?;
        Ok(IdentifyResponse { contact })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::contact::ContactId;
    use crate::storage::InMemoryContactStore;

    #[test]
    fn phone_number_accepts_string_or_integer() {
        let req: IdentifyRequest =
            serde_json::from_str(r#"{"email":"a@x.com","phoneNumber":"123456"}"#).unwrap();
        assert_eq!(req.phone_number.as_deref(), Some("123456"));

        let req: IdentifyRequest = serde_json::from_str(r#"{"phoneNumber":123456}"#).unwrap();
        assert_eq!(req.phone_number.as_deref(), Some("123456"));
        assert_eq!(req.email, None);

        let req: IdentifyRequest = serde_json::from_str(r#"{"email":null,"phoneNumber":null}"#).unwrap();
        assert_eq!(req, IdentifyRequest::default());

        assert!(serde_json::from_str::<IdentifyRequest>(r#"{"phoneNumber":1.5}"#).is_err());
        assert!(serde_json::from_str::<IdentifyRequest>(r#"{"phoneNumber":[1]}"#).is_err());
    }

    #[test]
    fn empty_request_fails_validation() {
        let req: IdentifyRequest = serde_json::from_str(r#"{"email":""}"#).unwrap();
        assert!(matches!(req.identifiers(), Err(ValidationError::MissingIdentifier)));
    }

    #[test]
    fn response_uses_camel_case_keys() {
        let resolver = IdentityResolver::new(Arc::new(InMemoryContactStore::new()));
        let response = resolver
            .identify(&IdentifyRequest::new(Some("mcfly@hillvalley.edu"), Some("123456")))
            .unwrap();

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "contact": {
                    "primaryContactId": 1,
                    "emails": ["mcfly@hillvalley.edu"],
                    "phoneNumbers": ["123456"],
                    "secondaryContactIds": []
                }
            })
        );
        assert_eq!(response.contact.primary_contact_id, ContactId::new(1));
    }
}

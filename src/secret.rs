//! Secrets: wire model and CRUD operations.
//!
//! File attachments are handled transparently: reads download attachment
//! contents into the field value, writes upload or remove them based on the
//! field's value and the template's field definitions.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TssError;
use crate::server::SECRETS_RESOURCE;
use crate::template::SecretTemplate;
use crate::Server;

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// A secret stored in Secret Server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Secret {
    /// Secret name.
    pub name: String,
    /// Containing folder.
    #[serde(rename = "FolderID")]
    pub folder_id: i64,
    /// Secret id.
    #[serde(rename = "ID")]
    pub id: i64,
    /// Distributed-engine site.
    #[serde(rename = "SiteID")]
    pub site_id: i64,
    /// Template the secret is built from.
    #[serde(rename = "SecretTemplateID")]
    pub secret_template_id: i64,
    /// Optional secret policy.
    #[serde(rename = "SecretPolicyID", skip_serializing_if = "is_zero")]
    pub secret_policy_id: i64,
    /// Optional password-type web script.
    #[serde(rename = "PasswordTypeWebScriptID", skip_serializing_if = "is_zero")]
    pub password_type_web_script_id: i64,
    /// Launcher connect-as secret.
    #[serde(rename = "LauncherConnectAsSecretID")]
    pub launcher_connect_as_secret_id: i64,
    /// Check-out interval in minutes.
    pub check_out_interval_minutes: i64,
    pub active: bool,
    pub checked_out: bool,
    pub check_out_enabled: bool,
    pub auto_change_enabled: bool,
    pub check_out_change_password_enabled: bool,
    pub delay_indexing: bool,
    pub enable_inherit_permissions: bool,
    pub enable_inherit_secret_policy: bool,
    pub proxy_enabled: bool,
    pub requires_comment: bool,
    pub session_recording_enabled: bool,
    pub web_launcher_requires_incognito_mode: bool,
    /// The secret's fields.
    #[serde(rename = "Items")]
    pub fields: Vec<SecretField>,
    /// SSH key generation arguments. Write requests only; never present in
    /// responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_args: Option<SshKeyArgs>,
}

/// An item (field) in a secret.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecretField {
    #[serde(rename = "ItemID")]
    pub item_id: i64,
    #[serde(rename = "FieldID")]
    pub field_id: i64,
    #[serde(rename = "FileAttachmentID")]
    pub file_attachment_id: i64,
    pub field_name: String,
    /// Shorthand alias of the field.
    pub slug: String,
    pub field_description: String,
    /// Attachment filename, for file fields.
    pub filename: String,
    /// Field value. For file fields this carries the attachment contents.
    pub item_value: String,
    pub is_file: bool,
    pub is_notes: bool,
    pub is_password: bool,
}

/// Controls SSH key pair and passphrase generation on templates that support
/// it. Only meaningful on create.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SshKeyArgs {
    pub generate_passphrase: bool,
    pub generate_ssh_keys: bool,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SearchResult {
    #[allow(dead_code)]
    search_text: String,
    records: Vec<Secret>,
}

impl Secret {
    /// Value of the field whose name or slug matches `field_name`.
    pub fn field(&self, field_name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| field_name == f.field_name || field_name == f.slug)
            .map(|f| f.item_value.as_str())
    }

    /// Value of the field with the given field id.
    pub fn field_by_id(&self, field_id: i64) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| field_id == f.field_id)
            .map(|f| f.item_value.as_str())
    }

    /// Split this secret's fields into file fields and general fields, using
    /// the template's field definitions as the guide.
    fn separate_file_fields(
        &self,
        template: &SecretTemplate,
    ) -> Result<(Vec<SecretField>, Vec<SecretField>), TssError> {
        let mut file_fields = Vec::new();
        let mut general_fields = Vec::new();

        for field in &self.fields {
            let slug = if field.slug.is_empty() {
                template.field_id_to_slug(field.field_id).ok_or_else(|| {
                    TssError::Config(format!(
                        "field id '{}' is not defined on the secret template with id '{}'",
                        field.field_id, template.id
                    ))
                })?
            } else {
                field.slug.clone()
            };
            let template_field = template.field(&slug).ok_or_else(|| {
                TssError::Config(format!(
                    "field '{slug}' is not defined on the secret template with id '{}'",
                    template.id
                ))
            })?;
            if template_field.is_file {
                file_fields.push(field.clone());
            } else {
                general_fields.push(field.clone());
            }
        }

        Ok((file_fields, general_fields))
    }
}

impl Server {
    /// Fetch the secret with the given id.
    ///
    /// File attachments are downloaded and substituted for the (dummy) field
    /// value, so attachments are transparent to the caller.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error from the auth subsystem, or
    /// [`TssError::Api`] / [`TssError::Json`] on a failed or malformed
    /// response.
    pub async fn secret(&self, id: i64) -> Result<Secret, TssError> {
        debug!(id, "fetching secret");
        let body = self
            .access_resource(Method::GET, SECRETS_RESOURCE, &id.to_string(), None)
            .await?;
        let mut secret: Secret = serde_json::from_str(&body)?;

        for field in &mut secret.fields {
            if field.is_file && field.file_attachment_id != 0 && !field.filename.is_empty() {
                let path = format!("{id}/fields/{}", field.slug);
                field.item_value = self
                    .access_resource(Method::GET, SECRETS_RESOURCE, &path, None)
                    .await?;
            }
        }

        Ok(secret)
    }

    /// Search secrets by text, optionally restricted to an extended field.
    ///
    /// Search records are not fully populated, so each hit is re-fetched by
    /// id before being returned.
    ///
    /// # Errors
    ///
    /// Same as [`Server::secret`].
    pub async fn secrets(&self, search_text: &str, field: &str) -> Result<Vec<Secret>, TssError> {
        let body = self
            .search_resources(SECRETS_RESOURCE, search_text, field)
            .await?;
        let result: SearchResult = serde_json::from_str(&body)?;

        let mut secrets = Vec::with_capacity(result.records.len());
        for record in result.records {
            secrets.push(self.secret(record.id).await?);
        }
        Ok(secrets)
    }

    /// Create a new secret.
    ///
    /// # Errors
    ///
    /// Same as [`Server::secret`], plus [`TssError::Config`] when a field is
    /// not defined on the secret's template.
    pub async fn create_secret(&self, secret: Secret) -> Result<Secret, TssError> {
        self.write_secret(secret, Method::POST, "/").await
    }

    /// Update an existing secret.
    ///
    /// # Errors
    ///
    /// [`TssError::Config`] when SSH key generation is requested — that is
    /// only supported during creation — otherwise same as
    /// [`Server::create_secret`].
    pub async fn update_secret(&self, mut secret: Secret) -> Result<Secret, TssError> {
        if secret
            .ssh_key_args
            .as_ref()
            .is_some_and(|a| a.generate_ssh_keys || a.generate_passphrase)
        {
            return Err(TssError::Config(
                "SSH key and passphrase generation is only supported during secret creation"
                    .to_owned(),
            ));
        }
        secret.ssh_key_args = None;
        let path = secret.id.to_string();
        self.write_secret(secret, Method::PUT, &path).await
    }

    /// Delete the secret with the given id.
    ///
    /// # Errors
    ///
    /// Same as [`Server::secret`].
    pub async fn delete_secret(&self, id: i64) -> Result<(), TssError> {
        self.access_resource(Method::DELETE, SECRETS_RESOURCE, &id.to_string(), None)
            .await
            .map(|_| ())
    }

    async fn write_secret(
        &self,
        mut secret: Secret,
        method: Method,
        path: &str,
    ) -> Result<Secret, TssError> {
        let template = self.secret_template(secret.secret_template_id).await?;

        // Unless SSH key generation is populating the file fields itself,
        // take control of them: their contents are uploaded (or removed)
        // after the write, not sent inline.
        let mut file_fields = Vec::new();
        if !secret
            .ssh_key_args
            .as_ref()
            .is_some_and(|a| a.generate_ssh_keys)
        {
            let (files, general) = secret.separate_file_fields(&template)?;
            file_fields = files;
            secret.fields = general;
        }

        // An SshKeyArgs value with both flags false still trips server-side
        // validation on templates without key generation; drop it.
        if secret
            .ssh_key_args
            .as_ref()
            .is_some_and(|a| !a.generate_ssh_keys && !a.generate_passphrase)
        {
            secret.ssh_key_args = None;
        }

        let input = serde_json::to_value(&secret)?;
        let body = self
            .access_resource(method, SECRETS_RESOURCE, path, Some(&input))
            .await?;
        let written: Secret = serde_json::from_str(&body)?;

        self.update_files(written.id, &file_fields).await?;
        self.secret(written.id).await
    }

    /// Upload non-empty file fields as attachments; PATCH empty ones away.
    async fn update_files(
        &self,
        secret_id: i64,
        file_fields: &[SecretField],
    ) -> Result<(), TssError> {
        for field in file_fields {
            if field.item_value.is_empty() {
                let path = format!("{secret_id}/general");
                let input = serde_json::json!({
                    "Data": {
                        "SecretFields": [
                            { "Slug": field.slug, "Dirty": true, "Value": null }
                        ]
                    }
                });
                self.access_resource(Method::PATCH, SECRETS_RESOURCE, &path, Some(&input))
                    .await?;
            } else {
                self.upload_file(secret_id, field).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_secret() -> Secret {
        Secret {
            name: "db".to_owned(),
            id: 42,
            fields: vec![
                SecretField {
                    field_id: 1,
                    field_name: "Username".to_owned(),
                    slug: "username".to_owned(),
                    item_value: "svc".to_owned(),
                    ..Default::default()
                },
                SecretField {
                    field_id: 2,
                    field_name: "Password".to_owned(),
                    slug: "password".to_owned(),
                    item_value: "hunter2".to_owned(),
                    is_password: true,
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn field_matches_name_or_slug() {
        let secret = sample_secret();
        assert_eq!(secret.field("Password"), Some("hunter2"));
        assert_eq!(secret.field("password"), Some("hunter2"));
        assert_eq!(secret.field("missing"), None);
        assert_eq!(secret.field_by_id(1), Some("svc"));
        assert_eq!(secret.field_by_id(99), None);
    }

    #[test]
    fn wire_format_uses_pascal_case_and_items() {
        let value = serde_json::to_value(sample_secret()).unwrap();
        assert_eq!(value["ID"], 42);
        assert_eq!(value["Name"], "db");
        assert!(value["Items"].is_array());
        assert_eq!(value["Items"][0]["Slug"], "username");
        // Both omitempty ints are zero and must be absent.
        assert!(value.get("SecretPolicyID").is_none());
        assert!(value.get("PasswordTypeWebScriptID").is_none());
        assert!(value.get("SshKeyArgs").is_none());
    }

    #[test]
    fn response_parsing_tolerates_missing_fields() {
        let secret: Secret = serde_json::from_str(
            r#"{"ID": 7, "Name": "n", "Items": [{"Slug": "password", "ItemValue": "x"}]}"#,
        )
        .unwrap();
        assert_eq!(secret.id, 7);
        assert_eq!(secret.fields.len(), 1);
        assert_eq!(secret.field("password"), Some("x"));
    }
}

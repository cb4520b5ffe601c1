//! Secret templates: field definitions and server-side password generation.

use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use crate::error::TssError;
use crate::server::TEMPLATES_RESOURCE;
use crate::Server;

/// A secret template and its field definitions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecretTemplate {
    pub name: String,
    #[serde(rename = "ID")]
    pub id: i64,
    pub fields: Vec<SecretTemplateField>,
}

/// A field definition in a secret template.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SecretTemplateField {
    #[serde(rename = "SecretTemplateFieldID")]
    pub secret_template_field_id: i64,
    /// Shorthand alias of the field.
    pub field_slug_name: String,
    pub display_name: String,
    pub description: String,
    pub name: String,
    pub list_type: String,
    pub is_file: bool,
    pub is_list: bool,
    pub is_notes: bool,
    pub is_password: bool,
    pub is_required: bool,
    pub is_url: bool,
}

impl SecretTemplate {
    /// Shorthand alias of the field with the given field id.
    pub fn field_id_to_slug(&self, field_id: i64) -> Option<String> {
        self.fields
            .iter()
            .find(|f| field_id == f.secret_template_field_id)
            .map(|f| f.field_slug_name.clone())
    }

    /// Field id for the given shorthand alias.
    pub fn field_slug_to_id(&self, slug: &str) -> Option<i64> {
        self.field(slug).map(|f| f.secret_template_field_id)
    }

    /// The field definition with the given shorthand alias.
    pub fn field(&self, slug: &str) -> Option<&SecretTemplateField> {
        self.fields.iter().find(|f| slug == f.field_slug_name)
    }
}

impl Server {
    /// Fetch the secret template with the given id.
    ///
    /// # Errors
    ///
    /// Returns any acquisition error from the auth subsystem, or
    /// [`TssError::Api`] / [`TssError::Json`] on a failed or malformed
    /// response.
    pub async fn secret_template(&self, id: i64) -> Result<SecretTemplate, TssError> {
        debug!(id, "fetching secret template");
        let body = self
            .access_resource(Method::GET, TEMPLATES_RESOURCE, &id.to_string(), None)
            .await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Generate a password that satisfies the requirements of the template
    /// field with the given slug. Only meaningful for password fields.
    ///
    /// # Errors
    ///
    /// [`TssError::Config`] when the slug does not identify a field on the
    /// template; otherwise same as [`Server::secret_template`].
    pub async fn generate_password(
        &self,
        slug: &str,
        template: &SecretTemplate,
    ) -> Result<String, TssError> {
        let field_id = template.field_slug_to_id(slug).ok_or_else(|| {
            TssError::Config(format!(
                "'{slug}' does not identify a field on the template '{}'",
                template.name
            ))
        })?;

        let path = format!("generate-password/{field_id}");
        let body = self
            .access_resource(Method::POST, TEMPLATES_RESOURCE, &path, None)
            .await?;

        // The endpoint returns a bare JSON string.
        let password = body
            .trim()
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(body.trim());
        Ok(password.to_owned())
    }
}

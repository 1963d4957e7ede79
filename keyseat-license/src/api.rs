//! Typed endpoints of the license service (JSON:API documents).
//!
//! Every method goes through [`SignedClient::call`], so documents are only
//! deserialized from verified bodies.

use crate::client::SignedClient;
use crate::credential::Credential;
use crate::device::MachineFingerprint;
use crate::error::{LicenseError, LicenseResult};
use crate::signature::SignedResponse;
use crate::transport::{ApiRequest, Auth, Transport};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

/// Hard stop for `links.next` chains.
const MAX_PAGES: usize = 10_000;

// ── JSON:API envelopes ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Document<D> {
    pub data: D,
    #[serde(default)]
    pub links: Option<Links>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Resource<A> {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub attributes: A,
    #[serde(default)]
    pub relationships: HashMap<String, Relationship>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub meta: Option<Value>,
}

impl<A> Resource<A> {
    /// Id of a to-one relationship, e.g. `license` on a machine.
    #[must_use]
    pub fn related_id(&self, name: &str) -> Option<&str> {
        self.relationships
            .get(name)?
            .data
            .as_ref()?
            .get("id")?
            .as_str()
    }

    /// `meta.count` of a to-many relationship, e.g. `machines` on a license.
    #[must_use]
    pub fn related_count(&self, name: &str) -> Option<u64> {
        self.relationships.get(name)?.meta.as_ref()?.get("count")?.as_u64()
    }
}

// ── Domain types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProductAttributes {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IdentityAttributes {
    pub full_name: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LicenseAttributes {
    pub key: Option<String>,
    pub status: Option<String>,
    pub suspended: bool,
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineAttributes {
    pub fingerprint: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TokenAttributes {
    token: Option<String>,
}

/// A product visible to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: String,
    pub name: String,
}

/// The authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub kind: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} <{}>",
            self.name.as_deref().unwrap_or("(unknown)"),
            self.email.as_deref().unwrap_or("(unknown)")
        )
    }
}

/// A license entitlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    pub id: String,
    pub key: Option<String>,
    pub product_id: Option<String>,
}

/// A machine activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: String,
    pub fingerprint: Option<String>,
    pub license_id: Option<String>,
}

/// Why a key failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidationReason {
    Expired,
    WrongMachine,
    UnknownKey,
    PoolExhausted,
    Revoked,
    /// Valid key with no machine bound yet; activation would bind it.
    NotActivated,
    Other(String),
}

impl ValidationReason {
    fn from_code(code: &str) -> Self {
        match code {
            "EXPIRED" | "OVERDUE" => Self::Expired,
            "FINGERPRINT_SCOPE_MISMATCH" | "MACHINE_SCOPE_MISMATCH" => Self::WrongMachine,
            "NOT_FOUND" => Self::UnknownKey,
            "TOO_MANY_MACHINES" | "TOO_MANY_CORES" | "TOO_MANY_PROCESSES" => Self::PoolExhausted,
            "SUSPENDED" | "BANNED" => Self::Revoked,
            "NO_MACHINE" | "NO_MACHINES" => Self::NotActivated,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("license expired"),
            Self::WrongMachine => f.write_str("license is bound to a different machine"),
            Self::UnknownKey => f.write_str("unknown license key"),
            Self::PoolExhausted => f.write_str("no activations left on this license"),
            Self::Revoked => f.write_str("license suspended or revoked"),
            Self::NotActivated => f.write_str("license not activated on this machine"),
            Self::Other(code) => write!(f, "rejected ({code})"),
        }
    }
}

/// Result of an online key validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub code: String,
    pub reason: Option<ValidationReason>,
}

#[derive(Debug, Deserialize)]
struct ValidationDocument {
    meta: ValidationMeta,
}

#[derive(Debug, Deserialize)]
struct ValidationMeta {
    valid: bool,
    code: String,
}

/// License counts for one product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub total: u64,
    pub activated: u64,
}

impl PoolCounts {
    #[must_use]
    pub fn inactive(&self) -> u64 {
        self.total - self.activated
    }
}

/// License pool summary across products.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub overall: PoolCounts,
    pub by_product: BTreeMap<String, PoolCounts>,
}

fn license_in_use(resource: &Resource<LicenseAttributes>, now: DateTime<Utc>) -> bool {
    let attrs = &resource.attributes;
    let active = attrs
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("active"));
    let unexpired = attrs.expiry.is_none_or(|exp| exp > now);
    let bound = resource.related_count("machines").unwrap_or(0) > 0;
    active && !attrs.suspended && unexpired && bound
}

fn to_license(resource: Resource<LicenseAttributes>) -> License {
    License {
        product_id: resource.related_id("product").map(str::to_string),
        id: resource.id,
        key: resource.attributes.key,
    }
}

fn to_machine(resource: Resource<MachineAttributes>) -> Machine {
    Machine {
        license_id: resource.related_id("license").map(str::to_string),
        id: resource.id,
        fingerprint: resource.attributes.fingerprint,
    }
}

fn with_segment(mut url: reqwest::Url, segment: &str) -> LicenseResult<reqwest::Url> {
    let rendered = url.to_string();
    url.path_segments_mut()
        .map_err(|()| LicenseError::Config(format!("cannot extend URL {rendered}")))?
        .push(segment);
    Ok(url)
}

// ── Endpoints ────────────────────────────────────────────────────

impl<T: Transport> SignedClient<T> {
    fn get_document<D: DeserializeOwned>(
        &self,
        url: reqwest::Url,
        credential: Option<&Credential>,
    ) -> LicenseResult<Document<D>> {
        let request = self.request(Method::GET, url, credential);
        self.call(&request)?.json()
    }

    fn post_json(
        &self,
        url: reqwest::Url,
        credential: Option<&Credential>,
        body: &Value,
        retryable: bool,
    ) -> LicenseResult<SignedResponse> {
        let mut request = self.request(Method::POST, url, credential);
        request.body = Some(serde_json::to_vec(body)?);
        request.retryable = retryable;
        self.call(&request)
    }

    /// Walks a collection page by page via `links.next`.
    ///
    /// `on_page` returns `false` to stop early. Returns the pages visited.
    ///
    /// # Errors
    ///
    /// Propagates any request or payload error.
    pub fn paginate<A: DeserializeOwned>(
        &self,
        path: &str,
        page_size: u32,
        credential: Option<&Credential>,
        mut on_page: impl FnMut(Vec<Resource<A>>) -> bool,
    ) -> LicenseResult<usize> {
        let size = page_size.max(1).to_string();
        let mut url = self.account_url(path, &[("page[size]", &size), ("page[number]", "1")])?;
        let mut pages = 0;

        while pages < MAX_PAGES {
            let doc: Document<Vec<Resource<A>>> = self.get_document(url, credential)?;
            pages += 1;
            if !on_page(doc.data) {
                break;
            }
            match doc.links.and_then(|l| l.next) {
                Some(next) => url = self.resolve_link(&next)?,
                None => break,
            }
        }
        debug!(path, pages, "pagination finished");
        Ok(pages)
    }

    /// Exchanges email and password for a bearer token. Attempted once.
    ///
    /// # Errors
    ///
    /// [`LicenseError::Unauthorized`] for bad credentials,
    /// [`LicenseError::InvalidPayload`] if no token is returned.
    pub fn create_token(&self, email: &str, password: &str) -> LicenseResult<String> {
        let request = ApiRequest {
            method: Method::POST,
            url: self.account_url("/tokens", &[])?,
            auth: Auth::Basic {
                username: email.to_string(),
                password: password.to_string(),
            },
            body: None,
            retryable: false,
        };
        let doc: Document<Resource<TokenAttributes>> = self.call(&request)?.json()?;
        info!(token_id = %doc.data.id, "token issued");
        doc.data
            .attributes
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LicenseError::InvalidPayload("token missing from response".to_string()))
    }

    /// Returns the authenticated principal.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn whoami(&self, credential: &Credential) -> LicenseResult<Identity> {
        let doc: Document<Resource<IdentityAttributes>> =
            self.get_document(self.account_url("/me", &[])?, Some(credential))?;
        let attrs = doc.data.attributes;
        let joined = [attrs.first_name, attrs.last_name]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
        let name = attrs
            .full_name
            .filter(|n| !n.is_empty())
            .or_else(|| (!joined.is_empty()).then_some(joined));
        Ok(Identity {
            id: doc.data.id,
            kind: doc.data.kind,
            name,
            email: attrs.email,
        })
    }

    /// Lists every product visible to the credential.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn list_products(&self, credential: &Credential) -> LicenseResult<Vec<Product>> {
        let mut products = Vec::new();
        self.paginate::<ProductAttributes>("/products", 100, Some(credential), |page| {
            products.extend(page.into_iter().map(|r| Product {
                name: r.attributes.name.unwrap_or_default(),
                id: r.id,
            }));
            true
        })?;
        Ok(products)
    }

    /// Finds this machine's activation for a product.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn find_machine(
        &self,
        credential: &Credential,
        fingerprint: &MachineFingerprint,
        product_id: &str,
    ) -> LicenseResult<Option<Machine>> {
        let url = self.account_url(
            "/machines",
            &[
                ("fingerprint", fingerprint.as_str()),
                ("product", product_id),
                ("limit", "1"),
            ],
        )?;
        let doc: Document<Vec<Resource<MachineAttributes>>> =
            self.get_document(url, Some(credential))?;
        Ok(doc.data.into_iter().next().map(to_machine))
    }

    /// Finds a license of the product with no machine attached.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn find_unactivated_license(
        &self,
        credential: &Credential,
        product_id: &str,
    ) -> LicenseResult<Option<License>> {
        let url = self.account_url(
            "/licenses",
            &[("activations[eq]", "0"), ("product", product_id), ("limit", "1")],
        )?;
        let doc: Document<Vec<Resource<LicenseAttributes>>> =
            self.get_document(url, Some(credential))?;
        Ok(doc.data.into_iter().next().map(to_license))
    }

    /// Fetches one license by id.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn retrieve_license(&self, credential: &Credential, license_id: &str) -> LicenseResult<License> {
        let url = with_segment(self.account_url("/licenses", &[])?, license_id)?;
        let doc: Document<Resource<LicenseAttributes>> = self.get_document(url, Some(credential))?;
        Ok(to_license(doc.data))
    }

    /// Binds the fingerprint to a license. Never retried: a repeated claim
    /// could consume a second license.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors; the caller interprets 402/422.
    pub fn activate_machine(
        &self,
        credential: &Credential,
        fingerprint: &MachineFingerprint,
        license_id: &str,
        metadata: &Value,
    ) -> LicenseResult<Machine> {
        let body = json!({
            "data": {
                "type": "machines",
                "attributes": {
                    "fingerprint": fingerprint.as_str(),
                    "metadata": metadata,
                },
                "relationships": {
                    "license": { "data": { "type": "licenses", "id": license_id } }
                }
            }
        });
        let url = self.account_url("/machines", &[])?;
        let doc: Document<Resource<MachineAttributes>> =
            self.post_json(url, Some(credential), &body, false)?.json()?;
        Ok(to_machine(doc.data))
    }

    /// Removes a machine activation.
    ///
    /// # Errors
    ///
    /// Propagates request errors; 404 surfaces as [`LicenseError::Http`].
    pub fn deactivate_machine(&self, credential: &Credential, machine_id: &str) -> LicenseResult<()> {
        let url = with_segment(self.account_url("/machines", &[])?, machine_id)?;
        let request = self.request(Method::DELETE, url, Some(credential));
        self.call(&request)?;
        Ok(())
    }

    /// Validates a key scoped to a fingerprint. Read-only, so retried.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn validate_key(
        &self,
        credential: Option<&Credential>,
        key: &str,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<Validation> {
        let body = json!({
            "meta": {
                "key": key,
                "scope": { "fingerprint": fingerprint.as_str() }
            }
        });
        let url = self.account_url("/licenses/actions/validate-key", &[])?;
        let doc: ValidationDocument = self.post_json(url, credential, &body, true)?.json()?;
        let reason = (!doc.meta.valid).then(|| ValidationReason::from_code(&doc.meta.code));
        Ok(Validation {
            valid: doc.meta.valid,
            code: doc.meta.code,
            reason,
        })
    }

    /// Tallies licenses per product. A license counts as activated when it
    /// is active, not suspended, unexpired and has a machine.
    ///
    /// # Errors
    ///
    /// Propagates request and payload errors.
    pub fn pool_status(&self, credential: &Credential) -> LicenseResult<PoolStatus> {
        let now = Utc::now();
        let mut status = PoolStatus::default();
        self.paginate::<LicenseAttributes>("/licenses", 50, Some(credential), |page| {
            for resource in &page {
                let in_use = license_in_use(resource, now);
                status.overall.total += 1;
                status.overall.activated += u64::from(in_use);
                if let Some(product) = resource.related_id("product") {
                    let bucket = status.by_product.entry(product.to_string()).or_default();
                    bucket.total += 1;
                    bucket.activated += u64::from(in_use);
                }
            }
            true
        })?;
        Ok(status)
    }
}

//! HTTP implementation of the upstream API contract.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use choreo_core::config::UpstreamConfig;
use choreo_core::{ErrorCode, IngestionError};

use crate::api::{
    message_names_expired_cursor, token_preview, ComponentDetail, ComponentRecord,
    OrganizationRecord, Page, PageRequest, ProjectRecord, UpstreamApi, UpstreamError,
};

#[derive(Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl UpstreamClient {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, IngestionError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            IngestionError::new(
                ErrorCode::InvalidConfig,
                format!("CHOREO_BASE_URL is not a valid URL: {}", e),
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| IngestionError::new(ErrorCode::InvalidConfig, e.to_string()))?;
        Ok(Self {
            http,
            base_url,
            token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Protocol("base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        mut url: Url,
        page: Option<&PageRequest>,
    ) -> Result<T, UpstreamError> {
        let sent_cursor = page.and_then(|p| p.cursor.clone());
        if let Some(page) = page {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &page.limit.to_string());
            if let Some(cursor) = &page.cursor {
                query.append_pair("cursor", cursor);
            }
        }

        let path = url.path().to_string();
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::GONE {
            return Err(UpstreamError::CursorExpired {
                preview: token_preview(sent_cursor.as_deref().unwrap_or("")),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound { path });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if sent_cursor.is_some() && message_names_expired_cursor(&body) {
                return Err(UpstreamError::CursorExpired {
                    preview: token_preview(sent_cursor.as_deref().unwrap_or("")),
                });
            }
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                path,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Protocol(format!("invalid response body: {}", e)))
    }
}

#[async_trait]
impl UpstreamApi for UpstreamClient {
    async fn probe_pagination(&self) -> Result<bool, UpstreamError> {
        let url = self.endpoint(&["orgs"])?;
        let probe = PageRequest {
            cursor: None,
            limit: 1,
        };
        match self
            .get_json::<serde_json::Value>(url, Some(&probe))
            .await
        {
            // A paginated upstream wraps results in an envelope with an
            // items field; older servers return a bare array.
            Ok(body) => Ok(body.get("items").is_some()),
            Err(UpstreamError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_organizations(
        &self,
        page: &PageRequest,
    ) -> Result<Page<OrganizationRecord>, UpstreamError> {
        let url = self.endpoint(&["orgs"])?;
        self.get_json(url, Some(page)).await
    }

    async fn list_projects(
        &self,
        org: &str,
        page: &PageRequest,
    ) -> Result<Page<ProjectRecord>, UpstreamError> {
        let url = self.endpoint(&["orgs", org, "projects"])?;
        self.get_json(url, Some(page)).await
    }

    async fn list_components(
        &self,
        org: &str,
        project: &str,
        page: &PageRequest,
    ) -> Result<Page<ComponentRecord>, UpstreamError> {
        let url = self.endpoint(&["orgs", org, "projects", project, "components"])?;
        self.get_json(url, Some(page)).await
    }

    async fn get_component(
        &self,
        org: &str,
        project: &str,
        name: &str,
    ) -> Result<ComponentDetail, UpstreamError> {
        let url = self.endpoint(&["orgs", org, "projects", project, "components", name])?;
        self.get_json(url, None).await
    }
}

// ── Tests ─────────────────────────────────────────────────────

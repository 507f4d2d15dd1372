//! The phase state machine.
//!
//! [`CatalogCollector::next`] performs one bounded unit of traversal per
//! call: one upstream page, translated to entities, plus the cursor to pass
//! back on the following call. Phases advance `orgs → projects →
//! components`; the components phase signals `done` once the project queue
//! is consumed.
//!
//! Expired continuation tokens are recovered per phase: only the failing
//! phase's token and page accumulation are discarded, and the same position
//! is re-issued from its first page. A one-time capability probe can switch
//! the instance permanently into a non-paginated fetch-all mode for older
//! upstreams.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tracing::{info, warn};

use choreo_core::config::UpstreamConfig;
use choreo_core::CatalogEntity;

use crate::api::{ComponentRecord, Page, PageRequest, UpstreamApi, UpstreamError};
use crate::cursor::{ProjectKey, TraversalCursor, TraversalPhase};
use crate::translate::{
    translate_component_basic, translate_component_detail, translate_org, translate_project,
};

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub page_limit: u32,
    pub detail_concurrency: usize,
    pub detail_delay: Duration,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            page_limit: 100,
            detail_concurrency: 5,
            detail_delay: Duration::from_millis(100),
        }
    }
}

impl From<&UpstreamConfig> for CollectorOptions {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            page_limit: config.page_limit,
            detail_concurrency: config.detail_concurrency.max(1),
            detail_delay: Duration::from_millis(config.detail_delay_ms),
        }
    }
}

/// Result of one collector invocation.
#[derive(Debug, Clone)]
pub struct CollectorPage {
    pub entities: Vec<CatalogEntity>,
    /// Cursor for the next invocation; `None` exactly when `done`.
    pub cursor: Option<TraversalCursor>,
    pub done: bool,
}

impl CollectorPage {
    fn more(entities: Vec<CatalogEntity>, cursor: TraversalCursor) -> Self {
        Self {
            entities,
            cursor: Some(cursor),
            done: false,
        }
    }

    fn finished(entities: Vec<CatalogEntity>) -> Self {
        Self {
            entities,
            cursor: None,
            done: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchMode {
    Paged,
    Legacy,
}

pub struct CatalogCollector {
    api: Arc<dyn UpstreamApi>,
    options: CollectorOptions,
    // Decided once by the capability probe, read-only afterwards.
    mode: OnceLock<FetchMode>,
}

impl CatalogCollector {
    pub fn new(api: Arc<dyn UpstreamApi>, options: CollectorOptions) -> Self {
        Self {
            api,
            options,
            mode: OnceLock::new(),
        }
    }

    /// Fetch and translate one page of the traversal.
    pub async fn next(
        &self,
        cursor: Option<TraversalCursor>,
    ) -> Result<CollectorPage, UpstreamError> {
        match self.mode().await? {
            FetchMode::Legacy => self.collect_all().await,
            FetchMode::Paged => match cursor {
                None => self.orgs_fetch(TraversalCursor::initial()).await,
                Some(cursor) => match cursor.phase {
                    TraversalPhase::Orgs if cursor.org_api_cursor.is_some() => {
                        self.orgs_fetch(cursor).await
                    }
                    TraversalPhase::Orgs => {
                        Ok(CollectorPage::more(Vec::new(), enter_projects_phase(cursor)))
                    }
                    TraversalPhase::Projects => self.projects_step(cursor).await,
                    TraversalPhase::Components => self.components_step(cursor).await,
                },
            },
        }
    }

    async fn mode(&self) -> Result<FetchMode, UpstreamError> {
        if let Some(mode) = self.mode.get() {
            return Ok(*mode);
        }
        let mode = match self.api.probe_pagination().await {
            Ok(true) => FetchMode::Paged,
            Ok(false) => {
                info!("upstream does not paginate — using fetch-all mode");
                FetchMode::Legacy
            }
            Err(UpstreamError::NotFound { .. }) => {
                info!("pagination probe returned 404 — using fetch-all mode");
                FetchMode::Legacy
            }
            Err(e) => return Err(e),
        };
        Ok(*self.mode.get_or_init(|| mode))
    }

    fn page_request(&self, cursor: &Option<String>) -> PageRequest {
        PageRequest {
            cursor: cursor.clone(),
            limit: self.options.page_limit,
        }
    }

    // ── Orgs phase ────────────────────────────────────────────

    async fn orgs_fetch(
        &self,
        mut cursor: TraversalCursor,
    ) -> Result<CollectorPage, UpstreamError> {
        let request = self.page_request(&cursor.org_api_cursor);
        let page = match self.api.list_organizations(&request).await {
            Ok(page) => page,
            Err(e) if e.is_cursor_expiry() => {
                warn!(phase = "orgs", error = %e, "continuation expired — restarting organization listing");
                cursor.org_api_cursor = None;
                cursor.org_queue.clear();
                self.api
                    .list_organizations(&self.page_request(&None))
                    .await?
            }
            Err(e) => return Err(e),
        };

        let entities: Vec<CatalogEntity> = page.items.iter().map(translate_org).collect();
        cursor
            .org_queue
            .extend(page.items.iter().map(|o| o.name.clone()));

        match page.next_cursor {
            Some(next) => cursor.org_api_cursor = Some(next),
            None => cursor = enter_projects_phase(cursor),
        }
        Ok(CollectorPage::more(entities, cursor))
    }

    // ── Projects phase ────────────────────────────────────────

    async fn projects_step(
        &self,
        mut cursor: TraversalCursor,
    ) -> Result<CollectorPage, UpstreamError> {
        let org = match cursor.current_org() {
            Some(org) => org.to_string(),
            None => {
                cursor.phase = TraversalPhase::Components;
                cursor.project_api_cursor = None;
                cursor.current_project_index = 0;
                return Ok(CollectorPage::more(Vec::new(), cursor));
            }
        };

        let request = self.page_request(&cursor.project_api_cursor);
        let page = match self.api.list_projects(&org, &request).await {
            Ok(page) => page,
            Err(e) if e.is_cursor_expiry() => {
                warn!(phase = "projects", org = %org, error = %e, "continuation expired — restarting project listing for this organization");
                cursor.project_api_cursor = None;
                cursor.project_queue.retain(|key| key.org != org);
                self.api
                    .list_projects(&org, &self.page_request(&None))
                    .await?
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(org = %org, error = %e, "failed to list projects — organization absent this cycle");
                cursor.project_api_cursor = None;
                cursor.current_org_index += 1;
                return Ok(CollectorPage::more(Vec::new(), cursor));
            }
        };

        let entities: Vec<CatalogEntity> = page
            .items
            .iter()
            .map(|p| translate_project(&org, p))
            .collect();
        cursor
            .project_queue
            .extend(page.items.iter().map(|p| ProjectKey {
                org: org.clone(),
                project: p.name.clone(),
            }));

        match page.next_cursor {
            Some(next) => cursor.project_api_cursor = Some(next),
            None => {
                cursor.project_api_cursor = None;
                cursor.current_org_index += 1;
            }
        }
        Ok(CollectorPage::more(entities, cursor))
    }

    // ── Components phase ──────────────────────────────────────

    async fn components_step(
        &self,
        mut cursor: TraversalCursor,
    ) -> Result<CollectorPage, UpstreamError> {
        let key = match cursor.current_project().cloned() {
            Some(key) => key,
            None => return Ok(CollectorPage::finished(Vec::new())),
        };

        let request = self.page_request(&cursor.component_api_cursor);
        let page = match self.api.list_components(&key.org, &key.project, &request).await {
            Ok(page) => page,
            Err(e) if e.is_cursor_expiry() => {
                warn!(phase = "components", org = %key.org, project = %key.project, error = %e, "continuation expired — restarting component listing for this project");
                cursor.component_api_cursor = None;
                self.api
                    .list_components(&key.org, &key.project, &self.page_request(&None))
                    .await?
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(org = %key.org, project = %key.project, error = %e, "failed to list components — project absent this cycle");
                cursor.component_api_cursor = None;
                cursor.current_project_index += 1;
                return Ok(CollectorPage::more(Vec::new(), cursor));
            }
        };

        let entities = self.translate_components_page(&key, &page.items).await;

        match page.next_cursor {
            Some(next) => cursor.component_api_cursor = Some(next),
            None => {
                cursor.component_api_cursor = None;
                cursor.current_project_index += 1;
            }
        }
        Ok(CollectorPage::more(entities, cursor))
    }

    /// Translate a listed components page. Service-like components go
    /// through the bounded detail-fetch pool; a failed detail fetch degrades
    /// that one component to its basic translation.
    async fn translate_components_page(
        &self,
        key: &ProjectKey,
        items: &[ComponentRecord],
    ) -> Vec<CatalogEntity> {
        let mut entities = Vec::new();
        let mut service_like = Vec::new();
        for component in items {
            if component.kind.is_service_like() {
                service_like.push(component);
            } else {
                entities.push(translate_component_basic(
                    &key.org,
                    &key.project,
                    component,
                ));
            }
        }

        let mut chunks = service_like.chunks(self.options.detail_concurrency).peekable();
        while let Some(chunk) = chunks.next() {
            let fetches = chunk.iter().map(|c| self.fetch_detail(key, c));
            for translated in futures::future::join_all(fetches).await {
                entities.extend(translated);
            }
            if chunks.peek().is_some() && !self.options.detail_delay.is_zero() {
                tokio::time::sleep(self.options.detail_delay).await;
            }
        }
        entities
    }

    async fn fetch_detail(
        &self,
        key: &ProjectKey,
        component: &ComponentRecord,
    ) -> Vec<CatalogEntity> {
        match self
            .api
            .get_component(&key.org, &key.project, &component.name)
            .await
        {
            Ok(detail) => translate_component_detail(&key.org, &key.project, &detail),
            Err(e) => {
                warn!(
                    org = %key.org,
                    project = %key.project,
                    component = %component.name,
                    error = %e,
                    "detail fetch failed — using basic translation"
                );
                vec![translate_component_basic(&key.org, &key.project, component)]
            }
        }
    }

    // ── Legacy fetch-all mode ─────────────────────────────────

    /// Non-paginated fallback: everything in one `done` result. Trades
    /// bounded memory for compatibility with older upstreams.
    async fn collect_all(&self) -> Result<CollectorPage, UpstreamError> {
        let no_cursor = PageRequest {
            cursor: None,
            limit: self.options.page_limit,
        };

        let orgs: Page<_> = self.api.list_organizations(&no_cursor).await?;
        let mut entities: Vec<CatalogEntity> = orgs.items.iter().map(translate_org).collect();

        for org in &orgs.items {
            let projects = match self.api.list_projects(&org.name, &no_cursor).await {
                Ok(page) => page,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(org = %org.name, error = %e, "failed to list projects — organization absent this cycle");
                    continue;
                }
            };
            for project in &projects.items {
                entities.push(translate_project(&org.name, project));
                let key = ProjectKey {
                    org: org.name.clone(),
                    project: project.name.clone(),
                };
                let components = match self
                    .api
                    .list_components(&key.org, &key.project, &no_cursor)
                    .await
                {
                    Ok(page) => page,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(org = %key.org, project = %key.project, error = %e, "failed to list components — project absent this cycle");
                        continue;
                    }
                };
                entities.extend(self.translate_components_page(&key, &components.items).await);
            }
        }

        Ok(CollectorPage::finished(entities))
    }
}

/// Exit the orgs phase: projects start at the first queued organization.
fn enter_projects_phase(mut cursor: TraversalCursor) -> TraversalCursor {
    cursor.phase = TraversalPhase::Projects;
    cursor.org_api_cursor = None;
    cursor.current_org_index = 0;
    cursor
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ComponentDetail, ComponentKind, EndpointRecord, EndpointType, OrganizationRecord,
        ProjectRecord, UpstreamError,
    };
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    fn org(name: &str) -> OrganizationRecord {
        OrganizationRecord {
            name: name.to_string(),
            display_name: None,
            description: None,
        }
    }

    fn project(name: &str) -> ProjectRecord {
        ProjectRecord {
            name: name.to_string(),
            description: None,
        }
    }

    fn component(name: &str, kind: ComponentKind) -> ComponentRecord {
        ComponentRecord {
            name: name.to_string(),
            kind,
            description: None,
        }
    }

    fn page<T>(items: Vec<T>, next: Option<&str>) -> Page<T> {
        Page {
            items,
            next_cursor: next.map(String::from),
        }
    }

    /// Scripted upstream keyed by `(position, cursor)`.
    #[derive(Default)]
    struct MockUpstream {
        paged: bool,
        probe_not_found: bool,
        orgs: HashMap<Option<String>, Page<OrganizationRecord>>,
        projects: HashMap<(String, Option<String>), Page<ProjectRecord>>,
        components: HashMap<(String, String, Option<String>), Page<ComponentRecord>>,
        details: HashMap<String, ComponentDetail>,
        fail_projects_for: HashSet<String>,
        fail_detail_for: HashSet<String>,
        expire_components_once: Mutex<bool>,
        calls: Mutex<Vec<String>>,
    }

    impl MockUpstream {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamApi for MockUpstream {
        async fn probe_pagination(&self) -> Result<bool, UpstreamError> {
            self.record("probe".to_string());
            if self.probe_not_found {
                return Err(UpstreamError::NotFound {
                    path: "/orgs".to_string(),
                });
            }
            Ok(self.paged)
        }

        async fn list_organizations(
            &self,
            page: &PageRequest,
        ) -> Result<Page<OrganizationRecord>, UpstreamError> {
            self.record(format!("orgs cursor={:?}", page.cursor));
            self.orgs
                .get(&page.cursor)
                .cloned()
                .ok_or(UpstreamError::NotFound {
                    path: "/orgs".to_string(),
                })
        }

        async fn list_projects(
            &self,
            org: &str,
            page: &PageRequest,
        ) -> Result<Page<ProjectRecord>, UpstreamError> {
            self.record(format!("projects {} cursor={:?}", org, page.cursor));
            if self.fail_projects_for.contains(org) {
                return Err(UpstreamError::Status {
                    status: 500,
                    path: format!("/orgs/{}/projects", org),
                });
            }
            self.projects
                .get(&(org.to_string(), page.cursor.clone()))
                .cloned()
                .ok_or(UpstreamError::NotFound {
                    path: format!("/orgs/{}/projects", org),
                })
        }

        async fn list_components(
            &self,
            org: &str,
            project: &str,
            page: &PageRequest,
        ) -> Result<Page<ComponentRecord>, UpstreamError> {
            self.record(format!(
                "components {}/{} cursor={:?}",
                org, project, page.cursor
            ));
            {
                let mut expire = self.expire_components_once.lock().unwrap();
                if *expire {
                    *expire = false;
                    return Err(UpstreamError::CursorExpired {
                        preview: "stale-to…".to_string(),
                    });
                }
            }
            self.components
                .get(&(org.to_string(), project.to_string(), page.cursor.clone()))
                .cloned()
                .ok_or(UpstreamError::NotFound {
                    path: format!("/orgs/{}/projects/{}/components", org, project),
                })
        }

        async fn get_component(
            &self,
            org: &str,
            project: &str,
            name: &str,
        ) -> Result<ComponentDetail, UpstreamError> {
            self.record(format!("detail {}/{}/{}", org, project, name));
            if self.fail_detail_for.contains(name) {
                return Err(UpstreamError::Status {
                    status: 503,
                    path: format!("/orgs/{}/projects/{}/components/{}", org, project, name),
                });
            }
            self.details
                .get(name)
                .cloned()
                .ok_or(UpstreamError::NotFound {
                    path: name.to_string(),
                })
        }
    }

    fn collector(mock: MockUpstream) -> (CatalogCollector, Arc<MockUpstream>) {
        let api = Arc::new(mock);
        let options = CollectorOptions {
            page_limit: 10,
            detail_concurrency: 2,
            detail_delay: Duration::ZERO,
        };
        (CatalogCollector::new(api.clone(), options), api)
    }

    #[tokio::test]
    async fn test_first_call_pages_orgs_and_queues_names() {
        let mut mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        mock.orgs
            .insert(None, page(vec![org("acme"), org("globex")], Some("o2")));
        mock.orgs
            .insert(Some("o2".to_string()), page(vec![org("initech")], None));
        let (collector, _) = collector(mock);

        let first = collector.next(None).await.unwrap();
        assert_eq!(first.entities.len(), 2);
        assert!(!first.done);
        let cursor = first.cursor.unwrap();
        assert_eq!(cursor.phase, TraversalPhase::Orgs);
        assert_eq!(cursor.org_queue, vec!["acme", "globex"]);
        assert_eq!(cursor.org_api_cursor.as_deref(), Some("o2"));

        // Last org page: names appended, phase exits to projects.
        let second = collector.next(Some(cursor)).await.unwrap();
        assert_eq!(second.entities.len(), 1);
        let cursor = second.cursor.unwrap();
        assert_eq!(cursor.phase, TraversalPhase::Projects);
        assert_eq!(cursor.org_queue.len(), 3);
        assert_eq!(cursor.current_org_index, 0);
        assert!(cursor.org_api_cursor.is_none());
    }

    #[tokio::test]
    async fn test_orgs_phase_without_pending_cursor_transitions() {
        let mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        let (collector, api) = collector(mock);

        let mut cursor = TraversalCursor::initial();
        cursor.org_queue = vec!["acme".to_string()];
        let result = collector.next(Some(cursor)).await.unwrap();
        assert!(result.entities.is_empty());
        assert_eq!(result.cursor.unwrap().phase, TraversalPhase::Projects);
        // Transition is local: no list call beyond the probe.
        assert_eq!(api.calls(), vec!["probe"]);
    }

    #[tokio::test]
    async fn test_cursor_resumption_resumes_same_org_without_refetching() {
        let mut mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        mock.projects.insert(
            ("globex".to_string(), Some("p2".to_string())),
            page(vec![project("proj-b")], None),
        );
        let (collector, api) = collector(mock);

        // Cold restart with a cursor persisted mid-projects for globex.
        let cursor = TraversalCursor {
            phase: TraversalPhase::Projects,
            org_api_cursor: None,
            project_api_cursor: Some("p2".to_string()),
            component_api_cursor: None,
            org_queue: vec!["acme".to_string(), "globex".to_string()],
            current_org_index: 1,
            project_queue: vec![ProjectKey {
                org: "acme".to_string(),
                project: "proj-a".to_string(),
            }],
            current_project_index: 0,
        };

        let result = collector.next(Some(cursor)).await.unwrap();
        assert_eq!(result.entities.len(), 1);
        assert_eq!(result.entities[0].entity_ref(), "project:globex/proj-b");
        let cursor = result.cursor.unwrap();
        assert_eq!(cursor.current_org_index, 2);
        assert_eq!(cursor.project_queue.len(), 2);

        // Already-consumed organizations were not re-listed.
        assert!(api.calls().iter().all(|c| !c.starts_with("orgs")));
    }

    #[tokio::test]
    async fn test_components_expiry_recovery_is_non_fatal() {
        let mut mock = MockUpstream {
            paged: true,
            expire_components_once: Mutex::new(true),
            ..Default::default()
        };
        mock.components.insert(
            ("acme".to_string(), "billing".to_string(), None),
            page(vec![component("mailer", ComponentKind::Worker)], None),
        );
        let (collector, api) = collector(mock);

        let cursor = TraversalCursor {
            phase: TraversalPhase::Components,
            org_api_cursor: None,
            project_api_cursor: None,
            component_api_cursor: Some("stale-token".to_string()),
            org_queue: vec!["acme".to_string()],
            current_org_index: 1,
            project_queue: vec![ProjectKey {
                org: "acme".to_string(),
                project: "billing".to_string(),
            }],
            current_project_index: 0,
        };

        let result = collector.next(Some(cursor)).await.unwrap();
        assert_eq!(result.entities.len(), 1);
        assert!(!result.done);
        let cursor = result.cursor.unwrap();
        // That was the project's only page, so the position advanced.
        assert_eq!(cursor.current_project_index, 1);
        assert!(cursor.component_api_cursor.is_none());

        // Expired call plus the recovery fetch from the first page.
        let component_calls: Vec<_> = api
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("components"))
            .collect();
        assert_eq!(component_calls.len(), 2);
        assert!(component_calls[1].ends_with("cursor=None"));

        // Queue consumed → done.
        let finished = collector.next(Some(cursor)).await.unwrap();
        assert!(finished.done);
        assert!(finished.cursor.is_none());
    }

    #[tokio::test]
    async fn test_project_listing_failure_skips_the_subtree() {
        let mut mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        mock.fail_projects_for.insert("bad".to_string());
        mock.projects.insert(
            ("good".to_string(), None),
            page(vec![project("alpha")], None),
        );
        let (collector, _) = collector(mock);

        let cursor = TraversalCursor {
            phase: TraversalPhase::Projects,
            org_api_cursor: None,
            project_api_cursor: None,
            component_api_cursor: None,
            org_queue: vec!["bad".to_string(), "good".to_string()],
            current_org_index: 0,
            project_queue: Vec::new(),
            current_project_index: 0,
        };

        let skipped = collector.next(Some(cursor)).await.unwrap();
        assert!(skipped.entities.is_empty());
        assert!(!skipped.done);
        let cursor = skipped.cursor.unwrap();
        assert_eq!(cursor.current_org_index, 1);

        let next = collector.next(Some(cursor)).await.unwrap();
        assert_eq!(next.entities.len(), 1);
        assert_eq!(next.entities[0].entity_ref(), "project:good/alpha");
    }

    #[tokio::test]
    async fn test_service_fanout_and_detail_degradation() {
        let mut mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        mock.components.insert(
            ("acme".to_string(), "billing".to_string(), None),
            page(
                vec![
                    component("api-server", ComponentKind::Service),
                    component("flaky", ComponentKind::Service),
                    component("mailer", ComponentKind::Worker),
                ],
                None,
            ),
        );
        mock.details.insert(
            "api-server".to_string(),
            ComponentDetail {
                name: "api-server".to_string(),
                kind: ComponentKind::Service,
                description: None,
                endpoints: vec![
                    EndpointRecord {
                        name: "rest".to_string(),
                        endpoint_type: EndpointType::Http,
                        port: Some(8080),
                        base_path: None,
                    },
                    EndpointRecord {
                        name: "grpc".to_string(),
                        endpoint_type: EndpointType::Grpc,
                        port: Some(9090),
                        base_path: None,
                    },
                ],
            },
        );
        mock.fail_detail_for.insert("flaky".to_string());
        let (collector, _) = collector(mock);

        let cursor = TraversalCursor {
            phase: TraversalPhase::Components,
            org_api_cursor: None,
            project_api_cursor: None,
            component_api_cursor: None,
            org_queue: vec!["acme".to_string()],
            current_org_index: 1,
            project_queue: vec![ProjectKey {
                org: "acme".to_string(),
                project: "billing".to_string(),
            }],
            current_project_index: 0,
        };

        let result = collector.next(Some(cursor)).await.unwrap();
        // api-server fans out into component + 2 APIs, flaky degrades to its
        // basic form, mailer translates 1:1.
        assert_eq!(result.entities.len(), 5);
        let refs: Vec<String> = result.entities.iter().map(|e| e.entity_ref()).collect();
        assert!(refs.contains(&"component:acme/billing/api-server".to_string()));
        assert!(refs.contains(&"api:acme/billing/api-server-rest".to_string()));
        assert!(refs.contains(&"api:acme/billing/api-server-grpc".to_string()));
        assert!(refs.contains(&"component:acme/billing/flaky".to_string()));
        assert!(refs.contains(&"component:acme/billing/mailer".to_string()));
    }

    #[tokio::test]
    async fn test_legacy_fallback_is_deterministic() {
        let mut mock = MockUpstream {
            paged: false,
            probe_not_found: true,
            ..Default::default()
        };
        mock.orgs.insert(None, page(vec![org("acme")], None));
        mock.projects
            .insert(("acme".to_string(), None), page(vec![project("billing")], None));
        mock.components.insert(
            ("acme".to_string(), "billing".to_string(), None),
            page(vec![component("mailer", ComponentKind::Worker)], None),
        );
        let (collector, api) = collector(mock);

        for _ in 0..2 {
            let result = collector.next(None).await.unwrap();
            assert!(result.done);
            assert!(result.cursor.is_none());
            // org + project + component, all in one pass.
            assert_eq!(result.entities.len(), 3);
        }

        // No cursor-bearing request was ever issued.
        assert!(api.calls().iter().all(|c| !c.contains("cursor=Some")));
        // The probe ran exactly once.
        assert_eq!(api.calls().iter().filter(|c| *c == "probe").count(), 1);
    }

    #[tokio::test]
    async fn test_org_list_failure_propagates() {
        let mock = MockUpstream {
            paged: true,
            ..Default::default()
        };
        // No org page scripted → NotFound propagates out of the burst.
        let (collector, _) = collector(mock);
        assert!(collector.next(None).await.is_err());
    }
}

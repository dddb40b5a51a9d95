//! Protocol dispatcher
//!
//! Stateless per request: routes search/load/execute/sign onto the
//! resolver, searcher, chain executor, and orchestrator, and folds every
//! internal error into the `{status, error, data}` envelope. It also
//! implements the harness's `ToolDispatcher` seam so agent tool calls go
//! through exactly the same paths.

use crate::host::Host;
use async_trait::async_trait;
use globset::GlobBuilder;
use ryeos_core::protocol::{Request, Response};
use ryeos_core::{ArtifactId, ArtifactKind, Error, Result, Space, Verb};
use ryeos_harness::{ContinuationEngine, ToolCallSpec, ToolDispatcher, ToolOutcome};
use ryeos_store::{SearchOptions, Searcher, Signer};
use ryeos_threads::spawn::SpawnRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Dispatcher {
    host: Arc<Host>,
}

/// Internal routing failure; the detail variant carries extra structure
/// for the response envelope (e.g. the partial chain on integrity
/// failures).
enum RouteError {
    Plain(Error),
    WithDetail(Error, Value),
}

impl Dispatcher {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host }
    }

    pub async fn handle(&self, request: Request) -> Response {
        self.handle_as(None, request).await
    }

    /// `caller` is the thread id when the request originates inside a
    /// running thread; spawned workflows become its children.
    pub async fn handle_as(&self, caller: Option<&str>, request: Request) -> Response {
        let verb = request.verb;
        match self.route(caller, request).await {
            Ok(data) => Response::success(data),
            Err(RouteError::Plain(e)) => {
                debug!(verb = %verb, kind = e.kind(), "request failed");
                Response::failure(&e)
            }
            Err(RouteError::WithDetail(e, detail)) => {
                debug!(verb = %verb, kind = e.kind(), "request failed");
                Response::failure_with_detail(&e, detail)
            }
        }
    }

    async fn route(
        &self,
        caller: Option<&str>,
        request: Request,
    ) -> std::result::Result<Value, RouteError> {
        match request.verb {
            Verb::Search => self.search(&request).map_err(RouteError::Plain),
            Verb::Load => self.load(&request).map_err(RouteError::Plain),
            Verb::Sign => self.sign(&request).map_err(RouteError::Plain),
            Verb::Execute => self.execute(caller, &request).await,
        }
    }

    fn search(&self, request: &Request) -> Result<Value> {
        let query = request
            .query
            .as_deref()
            .ok_or_else(|| Error::validation("search requires a query"))?;
        let (kinds, prefix) = parse_scope(request)?;

        let options = SearchOptions {
            kinds,
            space: request.space.clone(),
            fuzzy: request.options.fuzzy,
            page: request.options.page,
            page_size: request.options.page_size.unwrap_or(10),
        };
        let (hits, total) = Searcher::new(&self.host.resolver).search(query, &options)?;
        let hits: Vec<_> = hits
            .into_iter()
            .filter(|hit| match &prefix {
                Some(prefix) => {
                    hit.id.as_str() == prefix || hit.id.as_str().starts_with(&format!("{prefix}/"))
                }
                None => true,
            })
            .collect();
        Ok(json!({"hits": hits, "total": total, "page": options.page}))
    }

    fn load(&self, request: &Request) -> Result<Value> {
        let (kind, id) = kind_and_id(request)?;
        let artifact = self
            .host
            .resolver
            .resolve(kind, &id, request.space.as_ref())?;

        let copied_to = match &request.options.destination {
            Some(dest) => Some(
                self.host
                    .resolver
                    .copy_between(kind, &id, request.space.as_ref(), dest)?,
            ),
            None => None,
        };

        Ok(json!({
            "id": artifact.id,
            "kind": artifact.kind,
            "space": artifact.space,
            "version": artifact.version,
            "metadata": artifact.metadata,
            "body": artifact.body,
            "path": artifact.path,
            "copied_to": copied_to,
        }))
    }

    async fn execute(
        &self,
        caller: Option<&str>,
        request: &Request,
    ) -> std::result::Result<Value, RouteError> {
        let (kind, id) = kind_and_id(request).map_err(RouteError::Plain)?;
        match kind {
            ArtifactKind::Tool => {
                let report = self
                    .host
                    .executor
                    .execute(&id, &request.params, request.options.dry_run)
                    .await
                    .map_err(|e| {
                        RouteError::WithDetail(
                            e.error,
                            json!({"partial_chain": e.partial_chain}),
                        )
                    })?;
                Ok(serde_json::to_value(report).map_err(|e| RouteError::Plain(e.into()))?)
            }
            ArtifactKind::Workflow => self
                .execute_workflow(caller, request, id)
                .await
                .map_err(RouteError::Plain),
            ArtifactKind::Knowledge => {
                // Executing knowledge just returns it as context.
                let artifact = self
                    .host
                    .resolver
                    .resolve(kind, &id, request.space.as_ref())
                    .map_err(RouteError::Plain)?;
                Ok(json!({"id": artifact.id, "body": artifact.body, "metadata": artifact.metadata}))
            }
        }
    }

    async fn execute_workflow(
        &self,
        caller: Option<&str>,
        request: &Request,
        id: ArtifactId,
    ) -> Result<Value> {
        if !request.options.thread {
            // Interpretation mode: the agent gets the body and runs it.
            let artifact = self
                .host
                .resolver
                .resolve(ArtifactKind::Workflow, &id, request.space.as_ref())?;
            return Ok(json!({
                "id": artifact.id,
                "mode": "interpret",
                "metadata": artifact.metadata,
                "body": artifact.body,
            }));
        }

        let mut spawn = SpawnRequest::new(id);
        spawn.inputs = request.params.clone();
        spawn.overrides = request.options.overrides;
        spawn.model = request.options.model.clone();
        spawn.parent_id = caller.map(String::from);
        spawn.detach = request.options.detach;
        if request.options.dry_run {
            return Err(Error::validation("dry_run applies to tools, not thread spawns"));
        }
        let outcome = self.host.orchestrator.spawn(spawn).await?;
        Ok(json!({
            "thread_id": outcome.thread_id,
            "pid": outcome.pid,
            "status": outcome.status,
            "result": outcome.result,
        }))
    }

    fn sign(&self, request: &Request) -> Result<Value> {
        let kind = request
            .kind
            .ok_or_else(|| Error::validation("sign requires a kind"))?;
        let pattern = request
            .id
            .as_deref()
            .or(request.query.as_deref())
            .ok_or_else(|| Error::validation("sign requires an id or glob"))?;
        if request.space.as_ref().map(Space::is_system).unwrap_or(false) {
            return Err(Error::validation("system tier artifacts are never signed locally"));
        }

        let targets = self.matching_ids(kind, pattern, request.space.as_ref())?;
        if targets.is_empty() {
            return Err(Error::not_found(format!("{kind} matching '{pattern}'")));
        }

        let signer = Signer::new(&self.host.signing_key);
        let extractor = self.host.resolver.extractors.get(kind);
        let mut statuses = Vec::new();
        for id in targets {
            statuses.push(self.sign_one(&signer, extractor, kind, &id, request.space.as_ref()));
        }
        let statuses: Vec<Value> = statuses
            .into_iter()
            .map(|s| match s {
                Ok(v) => v,
                Err((id, e)) => json!({"id": id, "signed": false, "error": {"kind": e.kind(), "message": e.to_string()}}),
            })
            .collect();
        Ok(json!({"signed": statuses}))
    }

    fn sign_one(
        &self,
        signer: &Signer<'_>,
        extractor: &ryeos_store::extractor::Extractor,
        kind: ArtifactKind,
        id: &ArtifactId,
        space: Option<&Space>,
    ) -> std::result::Result<Value, (String, Error)> {
        let fail = |e: Error| (id.to_string(), e);
        let (space, path, content) = self
            .host
            .resolver
            .read_raw(kind, id, space)
            .map_err(fail)?;
        if space.is_system() {
            return Err(fail(Error::validation("system tier is read-only")));
        }

        // Validate the extracted metadata before committing a signature.
        let body = match ryeos_store::sigline::split_content(&content) {
            Ok((_, _, body)) => body,
            Err(_) => content.clone(),
        };
        let metadata = extractor.parse(&body).map_err(fail)?;
        extractor.validate(id, &metadata).map_err(fail)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("md");
        let signed = signer.sign_content(&content, ryeos_store::framing_for_extension(ext));
        std::fs::write(&path, signed).map_err(|e| fail(e.into()))?;
        debug!(%id, path = %path.display(), "artifact signed");
        Ok(json!({"id": id, "signed": true, "space": space, "path": path}))
    }

    fn matching_ids(
        &self,
        kind: ArtifactKind,
        pattern: &str,
        space: Option<&Space>,
    ) -> Result<Vec<ArtifactId>> {
        if !pattern.contains('*') && !pattern.contains('?') {
            return Ok(vec![ArtifactId::new(pattern)?]);
        }
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| Error::validation(format!("invalid glob '{pattern}': {e}")))?
            .compile_matcher();
        let spaces = match space {
            Some(s) => vec![s.clone()],
            None => self
                .host
                .resolver
                .tiers
                .spaces()
                .into_iter()
                .filter(|s| !s.is_system())
                .collect(),
        };
        Ok(self
            .host
            .resolver
            .enumerate(kind, &spaces)
            .into_iter()
            .filter(|(_, id, _)| glob.is_match(id.as_str()))
            .map(|(_, id, _)| id)
            .collect())
    }
}

fn kind_and_id(request: &Request) -> Result<(ArtifactKind, ArtifactId)> {
    let kind = request
        .kind
        .ok_or_else(|| Error::validation("request requires a kind"))?;
    let id = request
        .id
        .as_deref()
        .ok_or_else(|| Error::validation("request requires an id"))?;
    Ok((kind, ArtifactId::new(id)?))
}

/// Scope grammar: `<kind>[.<prefix>.*]`. A malformed scope is an error,
/// not an empty result.
fn parse_scope(request: &Request) -> Result<(Vec<ArtifactKind>, Option<String>)> {
    let Some(scope) = request.scope.as_deref() else {
        let kinds = match request.kind {
            Some(kind) => vec![kind],
            None => ArtifactKind::all().to_vec(),
        };
        return Ok((kinds, None));
    };

    let (kind_str, rest) = match scope.split_once('.') {
        Some((k, rest)) => (k, Some(rest)),
        None => (scope, None),
    };
    let kind: ArtifactKind = kind_str
        .parse()
        .map_err(|_| Error::validation(format!("malformed scope '{scope}'")))?;
    let prefix = match rest {
        None => None,
        Some(rest) => {
            let prefix = rest
                .strip_suffix(".*")
                .ok_or_else(|| Error::validation(format!("malformed scope '{scope}'")))?;
            if prefix.is_empty() {
                return Err(Error::validation(format!("malformed scope '{scope}'")));
            }
            Some(prefix.replace('.', "/"))
        }
    };
    Ok((vec![kind], prefix))
}

/// Agent tool calls ride the same dispatch paths. Denials and failures
/// come back as error tool results; the harness never sees a Rust error.
#[async_trait]
impl ToolDispatcher for Dispatcher {
    async fn dispatch(&self, thread_id: &str, call: &ToolCallSpec) -> ToolOutcome {
        let mut request = Request::new(call.verb);
        request.kind = Some(call.kind);
        request.id = call.id.as_ref().map(|i| i.as_str().to_string());
        request.params = call.params.clone();
        if call.verb == Verb::Search {
            request.query = call
                .params
                .get("query")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        if call.verb == Verb::Execute && call.kind == ArtifactKind::Workflow {
            request.options.thread = true;
            request.options.detach = call
                .params
                .get("async")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            request.options.overrides = call
                .params
                .get("limits")
                .and_then(|v| serde_json::from_value(v.clone()).ok());
        }

        let response = self.handle_as(Some(thread_id), request).await;
        match (&response.status, &response.error) {
            (ryeos_core::protocol::ResponseStatus::Success, _) => {
                ToolOutcome::ok(response.data.to_string())
            }
            (_, Some(body)) => {
                warn!(thread = thread_id, kind = %body.kind, "tool call failed");
                ToolOutcome::error(format!("{}: {}", body.kind, body.message))
            }
            _ => ToolOutcome::error("unknown dispatch failure"),
        }
    }
}

/// Resume a terminal thread through the continuation engine.
pub async fn resume_thread(
    host: &Host,
    thread_id: &str,
    message: &str,
) -> Result<Value> {
    let engine = ContinuationEngine::default();
    let outcome = engine
        .resume(&host.orchestrator, thread_id, message)
        .await?;
    Ok(json!({
        "thread_id": outcome.thread_id,
        "status": outcome.status,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostConfig;
    use ryeos_core::protocol::ResponseStatus;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        dispatcher: Dispatcher,
        host: Arc<Host>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = HostConfig {
            project_dir: Some(dir.path().join("project")),
            user_dir: Some(dir.path().join("user")),
            ..HostConfig::default()
        };
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        let host = Arc::new(Host::init(config).unwrap());
        Fixture { _dir: dir, dispatcher: Dispatcher::new(host.clone()), host }
    }

    fn write_unsigned(fx: &Fixture, kind: ArtifactKind, id: &str, body: &str) {
        let id = ArtifactId::new(id).unwrap();
        let ext = fx.host.resolver.extractors.get(kind).primary_extension();
        let path = fx
            .host
            .resolver
            .path_for(&Space::Project, kind, &id, ext)
            .unwrap();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn sign_all(fx: &Fixture, kind: ArtifactKind, pattern: &str) {
        let mut req = Request::new(Verb::Sign);
        req.kind = Some(kind);
        req.id = Some(pattern.to_string());
        let resp = fx.dispatcher.handle(req).await;
        assert!(resp.is_success(), "sign failed: {:?}", resp.error);
    }

    #[tokio::test]
    async fn sign_then_load_roundtrip() {
        let fx = fixture();
        write_unsigned(&fx, ArtifactKind::Knowledge, "guides/intro",
            "---\nname: intro\ncategory: guides\ndescription: Getting started guide\n---\n\nWelcome to the system.\n");

        // Unsigned artifacts never load.
        let mut req = Request::new(Verb::Load);
        req.kind = Some(ArtifactKind::Knowledge);
        req.id = Some("guides/intro".into());
        let resp = fx.dispatcher.handle(req.clone()).await;
        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(resp.error.unwrap().kind, "IntegrityError");

        sign_all(&fx, ArtifactKind::Knowledge, "guides/*").await;

        let resp = fx.dispatcher.handle(req).await;
        assert!(resp.is_success());
        assert!(resp.data["body"].as_str().unwrap().contains("Welcome"));
        assert_eq!(resp.data["metadata"]["name"], "intro");
    }

    #[tokio::test]
    async fn search_with_scope() {
        let fx = fixture();
        write_unsigned(&fx, ArtifactKind::Knowledge, "guides/intro",
            "---\nname: intro\ncategory: guides\ndescription: Getting started guide\n---\n\nSetup and onboarding.\n");
        write_unsigned(&fx, ArtifactKind::Knowledge, "reference/api",
            "---\nname: api\ncategory: reference\ndescription: API reference\n---\n\nEndpoints and payloads.\n");
        sign_all(&fx, ArtifactKind::Knowledge, "*").await;

        let mut req = Request::new(Verb::Search);
        req.query = Some("guide".into());
        req.scope = Some("knowledge.guides.*".into());
        let resp = fx.dispatcher.handle(req).await;
        assert!(resp.is_success());
        let hits = resp.data["hits"].as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["id"], "guides/intro");

        // Malformed scope is a validation error.
        let mut req = Request::new(Verb::Search);
        req.query = Some("guide".into());
        req.scope = Some("knowledge.guides.".into());
        let resp = fx.dispatcher.handle(req).await;
        assert_eq!(resp.error.unwrap().kind, "ValidationError");
    }

    #[tokio::test]
    async fn execute_tool_dry_run_end_to_end() {
        let fx = fixture();
        write_unsigned(&fx, ArtifactKind::Tool, "files/read",
            "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/script\nconfig:\n  script: \"cat {path}\"\n");
        write_unsigned(&fx, ArtifactKind::Tool, "runtimes/script",
            "name: script\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: runtimes/subprocess\nexpects: [script]\nconfig:\n  command: \"{script}\"\n");
        write_unsigned(&fx, ArtifactKind::Tool, "runtimes/subprocess",
            "name: subprocess\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: \"«primitive»\"\nprimitive: subprocess\n");
        sign_all(&fx, ArtifactKind::Tool, "*").await;

        let mut req = Request::new(Verb::Execute);
        req.kind = Some(ArtifactKind::Tool);
        req.id = Some("files/read".into());
        req.params.insert("path".into(), json!("x.txt"));
        req.options.dry_run = true;
        let resp = fx.dispatcher.handle(req).await;
        assert!(resp.is_success(), "{:?}", resp.error);
        assert_eq!(resp.data["chain"].as_array().unwrap().len(), 3);
        assert_eq!(resp.data["validated_pairs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn tampered_chain_element_reports_partial() {
        let fx = fixture();
        write_unsigned(&fx, ArtifactKind::Tool, "files/read",
            "name: read\ncategory: files\nversion: 1.0.0\nruntime_ref: runtimes/subprocess\n");
        write_unsigned(&fx, ArtifactKind::Tool, "runtimes/subprocess",
            "name: subprocess\ncategory: runtimes\nversion: 1.0.0\nruntime_ref: \"«primitive»\"\nprimitive: subprocess\n");
        sign_all(&fx, ArtifactKind::Tool, "*").await;

        // One byte of tampering in the runtime.
        let id = ArtifactId::new("runtimes/subprocess").unwrap();
        let path = fx
            .host
            .resolver
            .path_for(&Space::Project, ArtifactKind::Tool, &id, "yaml")
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("primitive: subprocess", "primitive: subProcess")).unwrap();

        let mut req = Request::new(Verb::Execute);
        req.kind = Some(ArtifactKind::Tool);
        req.id = Some("files/read".into());
        let resp = fx.dispatcher.handle(req).await;
        let error = resp.error.unwrap();
        assert_eq!(error.kind, "IntegrityError");
        let partial = error.detail.unwrap()["partial_chain"].as_array().unwrap().clone();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0]["id"], "files/read");
    }

    #[tokio::test]
    async fn load_with_destination_copies_between_tiers() {
        let fx = fixture();
        write_unsigned(&fx, ArtifactKind::Knowledge, "guides/intro",
            "---\nname: intro\ncategory: guides\n---\n\nBody.\n");
        sign_all(&fx, ArtifactKind::Knowledge, "guides/intro").await;

        let mut req = Request::new(Verb::Load);
        req.kind = Some(ArtifactKind::Knowledge);
        req.id = Some("guides/intro".into());
        req.options.destination = Some(Space::User);
        let resp = fx.dispatcher.handle(req).await;
        assert!(resp.is_success());
        assert!(resp.data["copied_to"].as_str().unwrap().contains("user"));
    }
}

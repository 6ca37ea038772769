//! Ordered, per-imposter stub storage with response rotation.
//!
//! Stub order is the order the user sees and the order matching walks;
//! only explicit structural edits change it. Matching rotates the response
//! queue inside the matched stub and never moves the stub itself.

use super::types::{ResponseTemplate, StubDefinition};
use crate::error::{ImposterError, Result};
use crate::logging::ScopedLogger;
use crate::predicate::{stub_matches, Encoding, Predicate};
use crate::recording::{in_memory_factory, RequestStore, StoreFactory, PROXY_RESPONSE_TIME};
use crate::scripting::SharedState;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Opaque stub identity, used for addressing only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StubId(u64);

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stub-{}", self.0)
    }
}

struct StubEntry {
    id: StubId,
    predicates: Arc<Vec<Predicate>>,
    responses: Vec<ResponseTemplate>,
    /// `responses` expanded by `repeat`, rotated on every match
    queue: VecDeque<ResponseTemplate>,
    matches: Arc<dyn RequestStore>,
}

impl StubEntry {
    fn new(id: StubId, definition: StubDefinition, matches: Arc<dyn RequestStore>) -> Self {
        let mut entry = Self {
            id,
            predicates: Arc::new(definition.predicates),
            responses: definition.responses,
            queue: VecDeque::new(),
            matches,
        };
        entry.rebuild_queue();
        entry
    }

    fn rebuild_queue(&mut self) {
        self.queue = self
            .responses
            .iter()
            .flat_map(|response| std::iter::repeat(response.clone()).take(response.repeat()))
            .collect();
    }

    fn contains_response(&self, template: &ResponseTemplate) -> bool {
        self.responses.iter().any(|response| response == template)
    }

    fn definition(&self) -> StubDefinition {
        StubDefinition::new(self.predicates.to_vec(), self.responses.clone())
    }
}

struct RepositoryState {
    stubs: Vec<StubEntry>,
    next_id: u64,
}

impl RepositoryState {
    fn entry(&mut self, definition: StubDefinition, factory: &StoreFactory) -> StubEntry {
        let id = StubId(self.next_id);
        self.next_id += 1;
        StubEntry::new(id, definition, factory())
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.stubs.len() {
            return Err(ImposterError::validation(format!(
                "no stub at index {index}; {} stubs configured",
                self.stubs.len()
            )));
        }
        Ok(())
    }
}

/// Stub list of one imposter. Clones share the same underlying state.
#[derive(Clone)]
pub struct StubRepository {
    state: Arc<Mutex<RepositoryState>>,
    encoding: Encoding,
    store_factory: StoreFactory,
}

impl fmt::Debug for StubRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubRepository")
            .field("stubs", &self.len())
            .field("encoding", &self.encoding)
            .finish()
    }
}

impl StubRepository {
    pub fn new(encoding: Encoding) -> Self {
        Self::with_store_factory(encoding, in_memory_factory())
    }

    /// Repository whose stubs keep match history in stores from `factory`.
    pub fn with_store_factory(encoding: Encoding, factory: StoreFactory) -> Self {
        Self {
            state: Arc::new(Mutex::new(RepositoryState {
                stubs: Vec::new(),
                next_id: 0,
            })),
            encoding,
            store_factory: factory,
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn len(&self) -> usize {
        self.state.lock().stubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a stub, or insert it ahead of the first stub holding a
    /// response equal to `before`.
    pub fn add_stub(&self, definition: StubDefinition, before: Option<&ResponseTemplate>) -> StubId {
        let mut state = self.state.lock();
        let entry = state.entry(definition, &self.store_factory);
        let id = entry.id;
        let position = before
            .and_then(|template| state.stubs.iter().position(|stub| stub.contains_response(template)))
            .unwrap_or(state.stubs.len());
        state.stubs.insert(position, entry);
        debug!("Added {} at index {}", id, position);
        id
    }

    /// Insert at `index`; `index == len` appends.
    pub fn add_stub_at_index(&self, index: usize, definition: StubDefinition) -> Result<StubId> {
        let mut state = self.state.lock();
        if index > state.stubs.len() {
            return Err(ImposterError::validation(format!(
                "no stub at index {index}; {} stubs configured",
                state.stubs.len()
            )));
        }
        let entry = state.entry(definition, &self.store_factory);
        let id = entry.id;
        state.stubs.insert(index, entry);
        Ok(id)
    }

    pub fn overwrite_stub_at_index(&self, index: usize, definition: StubDefinition) -> Result<StubId> {
        let mut state = self.state.lock();
        state.check_index(index)?;
        let entry = state.entry(definition, &self.store_factory);
        let id = entry.id;
        state.stubs[index] = entry;
        Ok(id)
    }

    pub fn delete_stub_at_index(&self, index: usize) -> Result<StubDefinition> {
        let mut state = self.state.lock();
        state.check_index(index)?;
        Ok(state.stubs.remove(index).definition())
    }

    /// Replace every stub.
    pub fn overwrite_stubs(&self, definitions: Vec<StubDefinition>) {
        let mut state = self.state.lock();
        state.stubs.clear();
        for definition in definitions {
            let entry = state.entry(definition, &self.store_factory);
            state.stubs.push(entry);
        }
    }

    pub fn stubs(&self) -> Vec<StubDefinition> {
        self.state.lock().stubs.iter().map(StubEntry::definition).collect()
    }

    pub fn index_of(&self, id: StubId) -> Option<usize> {
        self.state.lock().stubs.iter().position(|stub| stub.id == id)
    }

    /// Select the response for a request.
    ///
    /// The first stub whose predicates all hold wins. Its queue head is
    /// moved to the tail and a clone is returned; no match yields an empty
    /// `is` response that records nothing.
    ///
    /// Predicates are evaluated on a snapshot taken without holding the
    /// lock, so a slow predicate `inject` does not stall other requests.
    /// If the matched stub is removed before its queue is rotated, matching
    /// starts over.
    pub fn get_response_for(
        &self,
        request: &Value,
        logger: &ScopedLogger,
        imposter_state: &SharedState,
    ) -> Result<MatchedResponse> {
        loop {
            let candidates: Vec<(StubId, Arc<Vec<Predicate>>)> = self
                .state
                .lock()
                .stubs
                .iter()
                .map(|stub| (stub.id, stub.predicates.clone()))
                .collect();

            let mut matched = None;
            for (id, predicates) in &candidates {
                if stub_matches(predicates, request, self.encoding, logger, imposter_state)? {
                    matched = Some(*id);
                    break;
                }
            }

            let Some(id) = matched else {
                logger.debug("no predicate match, using default response");
                return Ok(MatchedResponse {
                    template: ResponseTemplate::new(json!({ "is": {} })),
                    stub_id: None,
                    repository: self.clone(),
                    recorder: MatchRecorder::disarmed(request.clone()),
                });
            };

            let mut state = self.state.lock();
            let Some(stub) = state.stubs.iter_mut().find(|stub| stub.id == id) else {
                debug!("Matched {} was removed before rotation, matching again", id);
                continue;
            };
            let template = match stub.queue.pop_front() {
                Some(head) => {
                    stub.queue.push_back(head.clone());
                    head
                }
                None => ResponseTemplate::new(json!({ "is": {} })),
            };
            logger.debug(format!("using predicate match: {}", predicate_sources(&stub.predicates)));

            return Ok(MatchedResponse {
                template,
                stub_id: Some(stub.id),
                repository: self.clone(),
                recorder: MatchRecorder::new(stub.matches.clone(), request.clone()),
            });
        }
    }

    /// Index of the first stub after the one holding `template` whose
    /// predicates equal `predicates`.
    pub fn index_of_stub_to_add_response_to(
        &self,
        template: &ResponseTemplate,
        predicates: &[Value],
    ) -> Option<usize> {
        if predicates.is_empty() {
            return None;
        }
        let state = self.state.lock();
        let start = state
            .stubs
            .iter()
            .position(|stub| stub.contains_response(template))?;
        state
            .stubs
            .iter()
            .enumerate()
            .skip(start + 1)
            .find(|(_, stub)| {
                stub.predicates.len() == predicates.len()
                    && stub
                        .predicates
                        .iter()
                        .zip(predicates)
                        .all(|(existing, generated)| existing.source() == generated)
            })
            .map(|(index, _)| index)
    }

    /// Append a response to the stub at `index`.
    pub fn add_response_to(&self, index: usize, template: ResponseTemplate) -> Result<()> {
        let mut state = self.state.lock();
        state.check_index(index)?;
        let stub = &mut state.stubs[index];
        for _ in 0..template.repeat() {
            stub.queue.push_back(template.clone());
        }
        stub.responses.push(template);
        debug!("Appended response to stub at index {} ({} responses)", index, stub.responses.len());
        Ok(())
    }

    /// Drop every recorded proxy response, and any stub left empty.
    pub fn reset_proxies(&self) {
        let mut state = self.state.lock();
        for index in (0..state.stubs.len()).rev() {
            let stub = &mut state.stubs[index];
            let before = stub.responses.len();
            stub.responses.retain(|response| !response.is_recorded_proxy_response());
            if stub.responses.len() == before {
                continue;
            }
            if stub.responses.is_empty() {
                state.stubs.remove(index);
            } else {
                stub.rebuild_queue();
            }
        }
    }

    /// JSON snapshot of the stub list, optionally with match history.
    pub async fn to_json(&self, include_matches: bool) -> Value {
        let snapshot: Vec<(Value, Arc<dyn RequestStore>)> = {
            let state = self.state.lock();
            state
                .stubs
                .iter()
                .map(|stub| (stub.definition().to_json(), stub.matches.clone()))
                .collect()
        };

        let mut stubs = Vec::with_capacity(snapshot.len());
        for (mut stub, matches) in snapshot {
            if include_matches {
                let records = matches.get_requests().await;
                if let Value::Object(object) = &mut stub {
                    object.insert("matches".to_string(), Value::Array(records));
                }
            }
            stubs.push(stub);
        }
        Value::Array(stubs)
    }

    /// Merge `patch` into `field` of every live copy of `original` in a stub.
    fn patch_template(&self, id: StubId, original: &ResponseTemplate, field: &str, patch: &Map<String, Value>) {
        let mut state = self.state.lock();
        let Some(stub) = state.stubs.iter_mut().find(|stub| stub.id == id) else {
            return;
        };
        for template in stub.responses.iter_mut().chain(stub.queue.iter_mut()) {
            if template == original {
                template.patch(field, patch);
            }
        }
    }
}

fn predicate_sources(predicates: &[Predicate]) -> Value {
    Value::Array(predicates.iter().map(|p| p.source().clone()).collect())
}

/// A response template selected for a request, plus the hooks tied to the
/// stub it came from.
#[derive(Debug, Clone)]
pub struct MatchedResponse {
    template: ResponseTemplate,
    stub_id: Option<StubId>,
    repository: StubRepository,
    recorder: MatchRecorder,
}

impl MatchedResponse {
    pub fn template(&self) -> &ResponseTemplate {
        &self.template
    }

    /// `None` for the default response.
    pub fn stub_id(&self) -> Option<StubId> {
        self.stub_id
    }

    pub fn recorder(&self) -> &MatchRecorder {
        &self.recorder
    }

    /// Patch `field` on this clone and on the stub's live template so later
    /// matches see the change.
    pub fn set_metadata(&mut self, field: &str, patch: Map<String, Value>) {
        let original = self.template.clone();
        self.template.patch(field, &patch);
        if let Some(id) = self.stub_id {
            self.repository.patch_template(id, &original, field, &patch);
        }
    }
}

/// Single-use hook saving `{timestamp, request, response}` to a stub's
/// match history.
#[derive(Clone)]
pub struct MatchRecorder {
    store: Option<Arc<dyn RequestStore>>,
    request: Value,
    armed: Arc<AtomicBool>,
}

impl fmt::Debug for MatchRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchRecorder")
            .field("has_store", &self.store.is_some())
            .field("armed", &self.armed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MatchRecorder {
    fn new(store: Arc<dyn RequestStore>, request: Value) -> Self {
        Self {
            store: Some(store),
            request,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    fn disarmed(request: Value) -> Self {
        Self {
            store: None,
            request,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.store.is_some() && self.armed.load(Ordering::SeqCst)
    }

    /// Save the match; only the first call on a recorder (or any of its
    /// clones) writes.
    pub async fn record(&self, response: &Value) {
        let Some(store) = &self.store else {
            return;
        };
        if !self.armed.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut response = response.clone();
        if let Value::Object(object) = &mut response {
            object.remove(PROXY_RESPONSE_TIME);
        }
        store
            .save_request(json!({
                "timestamp": Utc::now().to_rfc3339(),
                "request": self.request,
                "response": response
            }))
            .await;
    }
}

//! Hook registries — application callbacks invoked at defined protocol
//! points.
//!
//! Three ordered chains: request (once per inbound request), block (after
//! every transmitted block), update (per queued update request). Hooks
//! run in registration order; extensions concatenate; decisions resolve
//! with precedence `error > pause > ok`, first error or first pause
//! short-circuiting the rest of the chain. Registration is a
//! configuration-time activity; chains are read-only during traversal.

use std::sync::{Arc, RwLock};

use lattice_core::message::{Extension, PeerId, ResponseStatus, SyncRequest};
use lattice_core::store::BlockLoader;

use crate::peersender::BlockData;
use crate::traversal::LinkChooser;

/// What a hook asks the executor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookDecision {
    #[default]
    Ok,
    /// Suspend the response; it stays resumable.
    Pause,
    /// Terminate the response with this status.
    Error(ResponseStatus),
}

/// Common per-hook return value.
#[derive(Default)]
pub struct HookOutcome {
    pub extensions: Vec<Extension>,
    pub decision: HookDecision,
}

impl HookOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn pause() -> Self {
        Self {
            decision: HookDecision::Pause,
            ..Default::default()
        }
    }

    pub fn error(status: ResponseStatus) -> Self {
        Self {
            decision: HookDecision::Error(status),
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }
}

// ── Request hooks ─────────────────────────────────────────────────────────────

/// Return value of a single request hook.
#[derive(Default)]
pub struct RequestHookOutcome {
    pub outcome: HookOutcome,
    /// A request is rejected unless some hook validates it.
    pub validated: bool,
    pub custom_loader: Option<Arc<dyn BlockLoader>>,
    pub custom_chooser: Option<LinkChooser>,
}

impl RequestHookOutcome {
    pub fn validate() -> Self {
        Self {
            validated: true,
            ..Default::default()
        }
    }

    pub fn reject() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, extension: Extension) -> Self {
        self.outcome.extensions.push(extension);
        self
    }

    pub fn with_decision(mut self, decision: HookDecision) -> Self {
        self.outcome.decision = decision;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn BlockLoader>) -> Self {
        self.custom_loader = Some(loader);
        self
    }

    pub fn with_chooser(mut self, chooser: LinkChooser) -> Self {
        self.custom_chooser = Some(chooser);
        self
    }
}

/// Merged result of the whole request-hook chain.
#[derive(Default)]
pub struct RequestResult {
    pub extensions: Vec<Extension>,
    pub decision: HookDecision,
    pub is_validated: bool,
    pub custom_loader: Option<Arc<dyn BlockLoader>>,
    pub custom_chooser: Option<LinkChooser>,
}

type RequestHookFn = dyn Fn(PeerId, &SyncRequest) -> RequestHookOutcome + Send + Sync;

#[derive(Default)]
pub struct RequestHooks {
    hooks: RwLock<Vec<Box<RequestHookFn>>>,
}

impl RequestHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        hook: impl Fn(PeerId, &SyncRequest) -> RequestHookOutcome + Send + Sync + 'static,
    ) {
        self.hooks.write().expect("hook registry poisoned").push(Box::new(hook));
    }

    /// Run the chain for one inbound request.
    pub fn process(&self, peer: PeerId, request: &SyncRequest) -> RequestResult {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        let mut result = RequestResult::default();
        for hook in hooks.iter() {
            let RequestHookOutcome {
                outcome,
                validated,
                custom_loader,
                custom_chooser,
            } = hook(peer, request);

            result.extensions.extend(outcome.extensions);
            result.is_validated |= validated;
            if let Some(loader) = custom_loader {
                result.custom_loader = Some(loader);
            }
            if let Some(chooser) = custom_chooser {
                result.custom_chooser = Some(chooser);
            }
            match outcome.decision {
                HookDecision::Ok => {}
                decision => {
                    result.decision = decision;
                    break;
                }
            }
        }
        result
    }
}

// ── Block hooks ───────────────────────────────────────────────────────────────

type BlockHookFn = dyn Fn(PeerId, &SyncRequest, BlockData) -> HookOutcome + Send + Sync;

#[derive(Default)]
pub struct BlockHooks {
    hooks: RwLock<Vec<Box<BlockHookFn>>>,
}

impl BlockHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        hook: impl Fn(PeerId, &SyncRequest, BlockData) -> HookOutcome + Send + Sync + 'static,
    ) {
        self.hooks.write().expect("hook registry poisoned").push(Box::new(hook));
    }

    /// Run the chain for one transmitted block.
    pub fn process(&self, peer: PeerId, request: &SyncRequest, block: BlockData) -> HookOutcome {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        run_chain(hooks.iter().map(|h| h(peer, request, block)))
    }
}

// ── Update hooks ──────────────────────────────────────────────────────────────

type UpdateHookFn = dyn Fn(PeerId, &SyncRequest, &SyncRequest) -> HookOutcome + Send + Sync;

#[derive(Default)]
pub struct UpdateHooks {
    hooks: RwLock<Vec<Box<UpdateHookFn>>>,
}

impl UpdateHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        hook: impl Fn(PeerId, &SyncRequest, &SyncRequest) -> HookOutcome + Send + Sync + 'static,
    ) {
        self.hooks.write().expect("hook registry poisoned").push(Box::new(hook));
    }

    /// Run the chain for one update against the original request.
    pub fn process(
        &self,
        peer: PeerId,
        request: &SyncRequest,
        update: &SyncRequest,
    ) -> HookOutcome {
        let hooks = self.hooks.read().expect("hook registry poisoned");
        run_chain(hooks.iter().map(|h| h(peer, request, update)))
    }
}

/// Merge a chain of outcomes: concatenate extensions, stop at the first
/// pause or error.
fn run_chain(outcomes: impl Iterator<Item = HookOutcome>) -> HookOutcome {
    let mut merged = HookOutcome::ok();
    for outcome in outcomes {
        merged.extensions.extend(outcome.extensions);
        match outcome.decision {
            HookDecision::Ok => {}
            decision => {
                merged.decision = decision;
                break;
            }
        }
    }
    merged
}

// ── Listeners ─────────────────────────────────────────────────────────────────

type CompletedListenerFn = dyn Fn(PeerId, &SyncRequest, ResponseStatus) + Send + Sync;

/// Notified exactly once when a response reaches a terminal status other
/// than cancellation.
#[derive(Default)]
pub struct CompletedListeners {
    listeners: RwLock<Vec<Box<CompletedListenerFn>>>,
}

impl CompletedListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        listener: impl Fn(PeerId, &SyncRequest, ResponseStatus) + Send + Sync + 'static,
    ) {
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .push(Box::new(listener));
    }

    pub fn notify(&self, peer: PeerId, request: &SyncRequest, status: ResponseStatus) {
        for listener in self
            .listeners
            .read()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(peer, request, status);
        }
    }
}

type CancelledListenerFn = dyn Fn(PeerId, &SyncRequest) + Send + Sync;

/// Notified exactly once when a response is cancelled.
#[derive(Default)]
pub struct CancelledListeners {
    listeners: RwLock<Vec<Box<CancelledListenerFn>>>,
}

impl CancelledListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: impl Fn(PeerId, &SyncRequest) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("listener registry poisoned")
            .push(Box::new(listener));
    }

    pub fn notify(&self, peer: PeerId, request: &SyncRequest) {
        for listener in self
            .listeners
            .read()
            .expect("listener registry poisoned")
            .iter()
        {
            listener(peer, request);
        }
    }
}

/// The full set of hook and listener registries a responder consults.
/// Registries are shared; register on them before or after startup.
#[derive(Clone, Default)]
pub struct ResponderHooks {
    pub request: Arc<RequestHooks>,
    pub block: Arc<BlockHooks>,
    pub update: Arc<UpdateHooks>,
    pub completed: Arc<CompletedListeners>,
    pub cancelled: Arc<CancelledListeners>,
}

impl ResponderHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::link::Link;
    use lattice_core::selector::Selector;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PEER: PeerId = [9u8; 32];

    fn request() -> SyncRequest {
        SyncRequest::new(1, Link::of(b"root"), Selector::all(), 0)
    }

    fn block() -> BlockData {
        BlockData {
            link: Link::of(b"block"),
            size: 8,
            index: 0,
        }
    }

    #[test]
    fn unvalidated_by_default() {
        let hooks = RequestHooks::new();
        let result = hooks.process(PEER, &request());
        assert!(!result.is_validated);
    }

    #[test]
    fn any_hook_can_validate() {
        let hooks = RequestHooks::new();
        hooks.register(|_, _| RequestHookOutcome::default());
        hooks.register(|_, _| RequestHookOutcome::validate());
        assert!(hooks.process(PEER, &request()).is_validated);
    }

    #[test]
    fn extensions_concatenate_in_registration_order() {
        let hooks = BlockHooks::new();
        hooks.register(|_, _, _| HookOutcome::ok().with_extension(Extension::new("a", &b""[..])));
        hooks.register(|_, _, _| HookOutcome::ok().with_extension(Extension::new("b", &b""[..])));

        let merged = hooks.process(PEER, &request(), block());
        let names: Vec<_> = merged.extensions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn first_error_short_circuits() {
        let called = Arc::new(AtomicUsize::new(0));
        let hooks = BlockHooks::new();
        hooks.register(|_, _, _| HookOutcome::error(ResponseStatus::RequestFailedUnknown));
        {
            let called = called.clone();
            hooks.register(move |_, _, _| {
                called.fetch_add(1, Ordering::SeqCst);
                HookOutcome::ok()
            });
        }

        let merged = hooks.process(PEER, &request(), block());
        assert_eq!(
            merged.decision,
            HookDecision::Error(ResponseStatus::RequestFailedUnknown)
        );
        assert_eq!(called.load(Ordering::SeqCst), 0, "later hooks must not run");
    }

    #[test]
    fn pause_short_circuits_after_no_error() {
        let hooks = UpdateHooks::new();
        hooks.register(|_, _, _| HookOutcome::ok());
        hooks.register(|_, _, _| HookOutcome::pause());
        hooks.register(|_, _, _| HookOutcome::error(ResponseStatus::RequestFailedUnknown));

        let merged = hooks.process(PEER, &request(), &request());
        assert_eq!(merged.decision, HookDecision::Pause);
    }

    #[test]
    fn extensions_before_short_circuit_are_kept() {
        let hooks = BlockHooks::new();
        hooks.register(|_, _, _| {
            HookOutcome::pause().with_extension(Extension::new("kept", &b""[..]))
        });
        hooks.register(|_, _, _| HookOutcome::ok().with_extension(Extension::new("lost", &b""[..])));

        let merged = hooks.process(PEER, &request(), block());
        assert_eq!(merged.extensions.len(), 1);
        assert_eq!(merged.extensions[0].name, "kept");
    }

    #[test]
    fn last_custom_loader_wins() {
        let hooks = RequestHooks::new();
        let store_a = lattice_core::store::MemoryBlockStore::new();
        let store_b = lattice_core::store::MemoryBlockStore::new();
        let marker = store_b.put(serde_json::json!("b"), vec![]);

        hooks.register(move |_, _| {
            RequestHookOutcome::validate().with_loader(Arc::new(store_a.clone()))
        });
        hooks.register(move |_, _| {
            RequestHookOutcome::validate().with_loader(Arc::new(store_b.clone()))
        });

        let result = hooks.process(PEER, &request());
        let loader = result.custom_loader.expect("loader installed");
        let found = loader
            .load(&marker, &lattice_core::cancel::CancelToken::new())
            .unwrap();
        assert!(found.is_some(), "second registration should win");
    }

    #[test]
    fn listeners_all_fire() {
        let listeners = CompletedListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            listeners.register(move |_, _, _| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        listeners.notify(PEER, &request(), ResponseStatus::CompletedFull);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}

//! Configured mappings and their forwarding state

use crate::listener::ListenerHandle;
use crate::mapping::MappingSpec;

/// One mapping and, while it is forwarded, the handle of its accept loop
#[derive(Debug)]
pub struct MappingState {
    spec: MappingSpec,
    forwarded: bool,
    listener: Option<ListenerHandle>,
}

impl MappingState {
    fn new(spec: MappingSpec) -> Self {
        Self {
            spec,
            forwarded: false,
            listener: None,
        }
    }

    pub fn spec(&self) -> &MappingSpec {
        &self.spec
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    pub fn listener(&self) -> Option<&ListenerHandle> {
        self.listener.as_ref()
    }

    fn clear(&mut self) {
        if let Some(handle) = self.listener.take() {
            handle.cancel();
        }
        self.forwarded = false;
    }
}

/// Ordered set of mapping states, owned by the supervisor
#[derive(Debug, Default)]
pub struct Registry {
    states: Vec<MappingState>,
}

impl Registry {
    pub fn new(specs: impl IntoIterator<Item = MappingSpec>) -> Self {
        Self {
            states: specs.into_iter().map(MappingState::new).collect(),
        }
    }

    /// Cancel every listener and mark everything unforwarded
    pub fn reset_all(&mut self) {
        for state in &mut self.states {
            state.clear();
        }
    }

    /// Record a started listener for the mapping at `index`
    ///
    /// A handle already stored there is cancelled and replaced.
    pub fn mark_forwarded(&mut self, index: usize, handle: ListenerHandle) {
        if let Some(state) = self.states.get_mut(index) {
            state.clear();
            state.listener = Some(handle);
            state.forwarded = true;
        }
    }

    /// Indices of mappings without a running listener
    pub fn pending(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| !state.forwarded)
            .map(|(index, _)| index)
            .collect()
    }

    /// Drop handles whose accept loop has exited; returns how many were dropped
    pub fn reap_finished(&mut self) -> usize {
        let mut reaped = 0;
        for state in &mut self.states {
            if state.listener.as_ref().is_some_and(|h| h.is_finished()) {
                state.clear();
                reaped += 1;
            }
        }
        reaped
    }

    pub fn forwarded_count(&self) -> usize {
        self.states.iter().filter(|state| state.forwarded).count()
    }

    pub fn is_fully_forwarded(&self) -> bool {
        self.states.iter().all(|state| state.forwarded)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MappingState> {
        self.states.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MappingState> {
        self.states.iter()
    }

    /// Forwarded flag of every mapping, in order
    pub fn forwarded_flags(&self) -> Vec<bool> {
        self.states.iter().map(|state| state.forwarded).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{ListenerSettings, TunnelListener};
    use crate::mapping::Direction;
    use autotun_transport::mock::{MockBehavior, MockSession};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn rtl(remote_port: u16) -> MappingSpec {
        MappingSpec::parse(
            &format!("127.0.0.1:2222,0.0.0.0:{}", remote_port),
            Direction::RemoteToLocal,
        )
        .unwrap()
    }

    async fn start(spec: &MappingSpec, session: &Arc<MockSession>, token: &CancellationToken) -> ListenerHandle {
        TunnelListener::start(spec, session.clone(), token, &ListenerSettings::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_new_registry_is_unforwarded() {
        let registry = Registry::new(vec![rtl(9000), rtl(9001)]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pending(), vec![0, 1]);
        assert_eq!(registry.forwarded_count(), 0);
        assert!(!registry.is_fully_forwarded());
    }

    #[test]
    fn test_empty_registry_is_fully_forwarded() {
        let registry = Registry::default();
        assert!(registry.is_empty());
        assert!(registry.is_fully_forwarded());
        assert!(registry.pending().is_empty());
    }

    #[tokio::test]
    async fn test_mark_and_reset() {
        let session = Arc::new(MockSession::new(MockBehavior::default()));
        let token = CancellationToken::new();
        let mut registry = Registry::new(vec![rtl(9000), rtl(9001)]);

        let handle = start(registry.get(1).unwrap().spec(), &session, &token).await;
        registry.mark_forwarded(1, handle);
        assert_eq!(registry.pending(), vec![0]);
        assert_eq!(registry.forwarded_flags(), vec![false, true]);
        assert_eq!(registry.get(1).unwrap().listener().unwrap().description(), "0.0.0.0:9001");

        registry.reset_all();
        assert_eq!(registry.pending(), vec![0, 1]);
        assert!(registry.iter().all(|state| state.listener().is_none()));
    }

    #[tokio::test]
    async fn test_reap_finished() {
        let session = Arc::new(MockSession::new(MockBehavior::default()));
        let token = CancellationToken::new();
        let mut registry = Registry::new(vec![rtl(9000), rtl(9001)]);

        for index in 0..2 {
            let handle = start(registry.get(index).unwrap().spec(), &session, &token).await;
            registry.mark_forwarded(index, handle);
        }
        assert!(registry.is_fully_forwarded());
        assert_eq!(registry.reap_finished(), 0);

        // Closing the session ends both accept loops
        session.drop_connection();
        for _ in 0..100 {
            if registry.iter().all(|s| s.listener().unwrap().is_finished()) {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(registry.reap_finished(), 2);
        assert_eq!(registry.forwarded_count(), 0);
    }
}

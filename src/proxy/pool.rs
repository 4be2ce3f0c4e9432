//
// src/proxy/pool.rs
//

use super::backend::Backend;
use crate::config::BackendConfig;
use std::collections::HashSet;
use std::sync::Arc;

/// The origin servers, in configuration order.
///
/// The list is fixed at construction; only per-backend state changes
/// afterwards. Selection strategies rely on the stable order for tie-breaks.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
}

impl BackendPool {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let mut seen = HashSet::new();
        let mut backends = Vec::with_capacity(configs.len());

        for (index, config) in configs.iter().enumerate() {
            let mut backend = Backend::new(config.url.clone(), config.weight);
            // The same origin may be listed twice; ids double as metric labels.
            if !seen.insert(backend.id.clone()) {
                let id = format!("{}#{}", backend.id, index);
                seen.insert(id.clone());
                backend = Backend::with_id(id, config.url.clone(), config.weight);
            }
            backends.push(Arc::new(backend));
        }

        tracing::info!("Backend pool created with {} backends", backends.len());
        Self { backends }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn all_backends(&self) -> Vec<Arc<Backend>> {
        self.backends.clone()
    }

    pub fn alive_backends(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_alive())
            .cloned()
            .collect()
    }

    pub fn alive_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_alive()).count()
    }

    pub fn get_backend(&self, id: &str) -> Option<Arc<Backend>> {
        self.backends.iter().find(|b| b.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub(crate) fn reset_selection_state(&self) {
        for backend in &self.backends {
            backend.reset_selection_state();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn configs(urls: &[&str]) -> Vec<BackendConfig> {
        urls.iter()
            .map(|u| BackendConfig::new(Url::parse(u).unwrap(), 1))
            .collect()
    }

    #[test]
    fn test_pool_preserves_order() {
        let pool = BackendPool::new(&configs(&[
            "http://10.0.0.1:80",
            "http://10.0.0.2:80",
            "http://10.0.0.3:80",
        ]));
        let ids: Vec<_> = pool.backends().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
    }

    #[test]
    fn test_duplicate_urls_get_distinct_ids() {
        let pool = BackendPool::new(&configs(&["http://backend:8080", "http://backend:8080"]));
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.backends()[0].id, "backend:8080");
        assert_eq!(pool.backends()[1].id, "backend:8080#1");
        assert!(pool.get_backend("backend:8080#1").is_some());
    }

    #[test]
    fn test_alive_filtering() {
        let pool = BackendPool::new(&configs(&["http://a:80", "http://b:80"]));
        assert_eq!(pool.alive_count(), 2);
        pool.backends()[0].mark_dead();
        assert_eq!(pool.alive_count(), 1);
        assert_eq!(pool.alive_backends()[0].id, "b:80");
    }
}

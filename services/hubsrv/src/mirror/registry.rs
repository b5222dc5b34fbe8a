//! Module registry
//!
//! Keyed by module id. The watcher writes mirror events into it, API
//! handlers read status blocks concurrently.

use dashmap::DashMap;
use errors::{HubError, HubResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::layout::MIRROR_LEN;
use super::module::{IoProperties, ModuleKind, ModuleStatus, StatusChange};
use super::state::ModuleState;
use crate::bus::BusLinkContext;
use crate::protocol::commands::RouterCommand;

/// Short description of one known module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleSummary {
    pub id: u8,
    pub name: String,
    pub kind: ModuleKind,
    pub type_code: [u8; 2],
    pub sw_version: String,
    pub io: IoProperties,
}

#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: DashMap<u8, ModuleStatus>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mirror block; changes are reported only for known modules
    pub fn apply_mirror(&self, module: u8, status: &[u8]) -> Vec<StatusChange> {
        match self.modules.get_mut(&module) {
            Some(mut entry) => entry.update_status(status),
            None => {
                debug!("Module {} registered from mirror", module);
                self.modules
                    .insert(module, ModuleStatus::new(module, status.to_vec()));
                Vec::new()
            },
        }
    }

    /// Full or compact status block
    pub fn status(&self, module: u8, full: bool) -> Option<Vec<u8>> {
        self.modules.get(&module).map(|m| {
            if full {
                m.status().to_vec()
            } else {
                m.compact_status().to_vec()
            }
        })
    }

    pub fn state(&self, module: u8) -> HubResult<ModuleState> {
        self.modules
            .get(&module)
            .ok_or_else(|| HubError::NotFound {
                resource: format!("module {module}"),
            })?
            .state()
    }

    /// Replace a module's named settings in place
    pub fn set_state(&self, module: u8, state: &ModuleState) -> HubResult<()> {
        let mut entry = self
            .modules
            .get_mut(&module)
            .ok_or_else(|| HubError::NotFound {
                resource: format!("module {module}"),
            })?;
        entry.set_state(state)
    }

    /// SMG block to upload for `state`; `None` when the router already has it
    pub fn changed_settings(&self, module: u8, state: &ModuleState) -> HubResult<Option<Vec<u8>>> {
        self.modules
            .get(&module)
            .ok_or_else(|| HubError::NotFound {
                resource: format!("module {module}"),
            })?
            .changed_smg(state)
    }

    /// Settings block (SMG) as served to configuration clients
    pub fn settings_block(&self, module: u8) -> Option<Vec<u8>> {
        self.modules.get(&module).map(|m| m.build_smg())
    }

    pub fn kind(&self, module: u8) -> Option<ModuleKind> {
        self.modules.get(&module).map(|m| m.kind())
    }

    /// Known module ids, ascending
    pub fn ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.modules.iter().map(|m| *m.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn contains(&self, module: u8) -> bool {
        self.modules.contains_key(&module)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// All modules ordered by id
    pub fn overview(&self) -> Vec<ModuleSummary> {
        let mut list: Vec<ModuleSummary> = self
            .modules
            .iter()
            .map(|m| ModuleSummary {
                id: m.id(),
                name: m.name(),
                kind: m.kind(),
                type_code: m.type_code(),
                sw_version: m.sw_version(),
                io: m.io_properties(),
            })
            .collect();
        list.sort_by_key(|m| m.id);
        list
    }

    pub fn remove(&self, module: u8) -> bool {
        self.modules.remove(&module).is_some()
    }
}

/// Read the module list of `router` and the mirror of every listed module
///
/// Modules answering with a short block or an error are skipped; the count of
/// stored modules is returned.
pub async fn fetch_modules(
    ctx: &BusLinkContext,
    router: u8,
    registry: &ModuleRegistry,
) -> HubResult<usize> {
    let list_cmd = RouterCommand::GetModules;
    let frame = ctx.send_and_await(router, &list_cmd).await?;
    let list = frame.message(list_cmd.frame_len());
    let Some((&count, ids)) = list.split_first() else {
        warn!("Router {} sent an empty module list", router);
        return Ok(0);
    };
    let ids = &ids[..ids.len().min(count as usize)];

    let mut stored = 0;
    for &module in ids {
        let cmd = RouterCommand::GetModuleStatus { module };
        match ctx.send_and_await(router, &cmd).await {
            Ok(frame) => {
                let block = frame.message(cmd.frame_len());
                if block.len() < MIRROR_LEN {
                    warn!(
                        "Module {} status of {} bytes skipped",
                        module,
                        block.len()
                    );
                    continue;
                }
                registry.apply_mirror(module, &block[..MIRROR_LEN]);
                stored += 1;
            },
            Err(e) => warn!("Module {} status not read: {}", module, e),
        }
    }
    info!("Router {}: {} of {} modules loaded", router, stored, ids.len());
    Ok(stored)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::bus::{BusMode, BusTiming, SerialLink};
    use crate::mirror::layout::{put_text, MirrorIndex, NAME_LEN};
    use crate::transport::{MockTransport, RouterSim};
    use std::sync::Arc;
    use std::time::Duration;

    fn mirror(id: u8, name: &str) -> Vec<u8> {
        let mut status = vec![0u8; MIRROR_LEN];
        status[MirrorIndex::MOD_ID] = id;
        status[MirrorIndex::MOD_DESC] = 10;
        status[MirrorIndex::MOD_DESC + 1] = 1;
        put_text(&mut status, MirrorIndex::MOD_NAME, NAME_LEN, name);
        status
    }

    #[test]
    fn test_first_mirror_registers_without_changes() {
        let registry = ModuleRegistry::new();
        assert!(registry.apply_mirror(3, &mirror(3, "Keller")).is_empty());
        assert!(registry.contains(3));

        let mut next = mirror(3, "Keller");
        next[MirrorIndex::OUT_1_8] = 1;
        let changes = registry.apply_mirror(3, &next);
        assert_eq!(changes.len(), 1);
        assert_eq!(registry.status(3, true).unwrap()[MirrorIndex::OUT_1_8], 1);
    }

    #[test]
    fn test_overview_sorted() {
        let registry = ModuleRegistry::new();
        registry.apply_mirror(7, &mirror(7, "B"));
        registry.apply_mirror(2, &mirror(2, "A"));
        let ids: Vec<u8> = registry.overview().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![2, 7]);
        assert_eq!(registry.overview()[0].kind, ModuleKind::Out);
    }

    #[test]
    fn test_unknown_module_state() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            registry.state(9),
            Err(HubError::NotFound { .. })
        ));
        assert!(registry.status(9, false).is_none());
    }

    #[test]
    fn test_set_state_in_place() {
        let registry = ModuleRegistry::new();
        registry.apply_mirror(2, &mirror(2, "Alt"));
        let mut state = registry.state(2).unwrap();
        state.name = "Neu".to_string();
        registry.set_state(2, &state).unwrap();
        assert_eq!(registry.overview()[0].name, "Neu");
    }

    #[test]
    fn test_changed_settings_follow_smg_crc() {
        let registry = ModuleRegistry::new();
        registry.apply_mirror(2, &mirror(2, "Alt"));

        let mut state = registry.state(2).unwrap();
        // The name is not part of the settings block
        state.name = "Neu".to_string();
        assert_eq!(registry.changed_settings(2, &state).unwrap(), None);

        state.t_short_ms = 400;
        let smg = registry.changed_settings(2, &state).unwrap().unwrap();
        assert_eq!(smg[0], 40);
        // Registry keeps the old block until the upload succeeds
        assert_ne!(registry.settings_block(2).unwrap(), smg);

        assert!(matches!(
            registry.changed_settings(5, &state),
            Err(HubError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_modules_stores_listed_mirrors() {
        let mock = Arc::new(MockTransport::with_responder(
            RouterSim::new()
                .with_module(mirror(3, "Flur"))
                .with_module(mirror(9, "Bad"))
                .into_responder(),
        ));
        let ctx = BusLinkContext::new(
            Arc::new(SerialLink::new(mock.clone())),
            BusTiming {
                settle: Duration::from_millis(1),
                ..Default::default()
            },
        );
        ctx.set_mode(BusMode::ClientServer);

        let registry = ModuleRegistry::new();
        assert_eq!(fetch_modules(&ctx, 1, &registry).await.unwrap(), 2);
        assert_eq!(registry.ids(), vec![3, 9]);
        assert_eq!(registry.overview()[0].name, "Flur");
        assert_eq!(mock.sent_frames().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_modules_skips_short_blocks() {
        let mock = Arc::new(MockTransport::with_responder(
            RouterSim::new().with_module(vec![4, 1, 2]).into_responder(),
        ));
        let ctx = BusLinkContext::new(
            Arc::new(SerialLink::new(mock.clone())),
            BusTiming {
                settle: Duration::from_millis(1),
                ..Default::default()
            },
        );
        ctx.set_mode(BusMode::ClientServer);

        let registry = ModuleRegistry::new();
        assert_eq!(fetch_modules(&ctx, 1, &registry).await.unwrap(), 0);
        assert!(registry.is_empty());
    }
}

//! Read-mostly snapshot of the active planting zones.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::{default_zones, PlantingZone};
use crate::infra::{Result, VerificationError, ZoneStore};

/// Zone catalog shared by the geospatial checker and the admin API.
///
/// Readers take an `Arc` snapshot once per check and never hold the lock
/// while checking. Admin updates persist first, then swap the snapshot.
pub struct ZoneCatalog {
    store: Option<Arc<dyn ZoneStore>>,
    snapshot: RwLock<Arc<Vec<PlantingZone>>>,
}

impl ZoneCatalog {
    /// Catalog backed by a store. Call [`ZoneCatalog::load`] before use.
    pub fn new(store: Arc<dyn ZoneStore>) -> Self {
        Self {
            store: Some(store),
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Fixed in-process catalog with no persistence.
    pub fn fixed(zones: Vec<PlantingZone>) -> Self {
        Self {
            store: None,
            snapshot: RwLock::new(Arc::new(zones)),
        }
    }

    /// Load from the store, seeding the default zones into an empty store.
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(self.snapshot.read().await.len());
        };

        let mut zones = store.list().await?;
        if zones.is_empty() {
            tracing::info!("Zone catalog empty, seeding default zones");
            for zone in default_zones() {
                store.upsert(&zone).await?;
            }
            zones = store.list().await?;
        }

        let count = zones.len();
        *self.snapshot.write().await = Arc::new(zones);
        tracing::info!(zones = count, "Zone catalog loaded");
        Ok(count)
    }

    /// Current zones (active and inactive).
    pub async fn snapshot(&self) -> Arc<Vec<PlantingZone>> {
        self.snapshot.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<PlantingZone> {
        self.snapshot().await.iter().find(|z| z.id == id).cloned()
    }

    /// Validate, persist and publish a zone.
    pub async fn upsert(&self, zone: PlantingZone) -> Result<()> {
        if !zone.is_well_formed() {
            return Err(VerificationError::ZoneConflict(format!(
                "zone {} needs at least three valid vertices and min <= max elevation",
                zone.id
            )));
        }

        if let Some(store) = &self.store {
            store.upsert(&zone).await?;
        }

        let mut guard = self.snapshot.write().await;
        let mut zones: Vec<PlantingZone> = guard.iter().filter(|z| z.id != zone.id).cloned().collect();
        zones.push(zone);
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        *guard = Arc::new(zones);
        Ok(())
    }
}

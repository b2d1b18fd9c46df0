//! Inventory service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// An item to reserve in inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub sku: String,
    pub quantity: u32,
}

/// Stock reservation operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves all items or none; returns the reservation id.
    async fn reserve(&self, items: &[ReservationItem]) -> Result<String, ServiceError>;

    /// Returns reserved stock. Releasing an unknown or already released
    /// reservation succeeds.
    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<String, u32>,
    reservations: HashMap<String, Vec<ReservationItem>>,
    next_id: u32,
}

/// In-memory inventory service.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds stock for a SKU.
    pub fn add_stock(&self, sku: impl Into<String>, quantity: u32) {
        *self
            .write()
            .stock
            .entry(sku.into())
            .or_default() += quantity;
    }

    /// Unreserved stock for a SKU.
    pub fn available(&self, sku: &str) -> u32 {
        self.read().stock.get(sku).copied().unwrap_or(0)
    }

    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read().reservations.contains_key(reservation_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryInventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, items: &[ReservationItem]) -> Result<String, ServiceError> {
        let mut state = self.write();

        for item in items {
            let available = state.stock.get(&item.sku).copied().unwrap_or(0);
            if available < item.quantity {
                return Err(ServiceError::InsufficientStock {
                    sku: item.sku.clone(),
                    requested: item.quantity,
                    available,
                });
            }
        }
        for item in items {
            if let Some(stock) = state.stock.get_mut(&item.sku) {
                *stock -= item.quantity;
            }
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), items.to_vec());
        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        if let Some(items) = state.reservations.remove(reservation_id) {
            for item in items {
                *state.stock.entry(item.sku).or_default() += item.quantity;
            }
        }
        Ok(())
    }
}

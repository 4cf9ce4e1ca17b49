//! Exclusive device ownership
//!
//! A [`DeviceHandle`] is the token proving a device is claimed. Dropping it
//! releases the claim back to the [`DeviceRegistry`] it came from.

use crate::capture::traits::{DeviceCapabilities, DeviceDescriptor, DevicePosition, DeviceRole};
use crate::utils::error::{SessionError, SessionResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which devices are currently claimed
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a device. Fails if someone already holds it.
    pub fn claim(&self, descriptor: DeviceDescriptor) -> SessionResult<DeviceHandle> {
        if !self.claimed.lock().insert(descriptor.id.clone()) {
            return Err(SessionError::DeviceUnavailable(format!(
                "{} is already in use",
                descriptor.name
            )));
        }

        tracing::debug!("Claimed device {}", descriptor.id);
        Ok(DeviceHandle {
            descriptor,
            registry: self.clone(),
        })
    }

    pub fn is_claimed(&self, id: &str) -> bool {
        self.claimed.lock().contains(id)
    }

    pub fn claimed_count(&self) -> usize {
        self.claimed.lock().len()
    }

    fn release(&self, id: &str) {
        if self.claimed.lock().remove(id) {
            tracing::debug!("Released device {}", id);
        }
    }
}

/// An exclusively claimed capture device
#[derive(Debug)]
pub struct DeviceHandle {
    descriptor: DeviceDescriptor,
    registry: DeviceRegistry,
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn role(&self) -> DeviceRole {
        self.descriptor.role
    }

    pub fn position(&self) -> DevicePosition {
        self.descriptor.position
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        self.descriptor.capabilities
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.registry.release(&self.descriptor.id);
    }
}

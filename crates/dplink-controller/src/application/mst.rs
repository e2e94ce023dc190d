//! MST coordinator: fans one physical link out into several streams.
//!
//! While active, the coordinator owns the link's time-slot allocation and
//! routes hotplug notifications through the topology manager instead of the
//! single-connector compositor path.

use std::sync::Arc;

use dplink_core::{SlotAllocation, SlotAllocator, SlotError, StreamId};
use thiserror::Error;
use tracing::{info, warn};

use super::hardware::{HardwareError, LinkController, MstTopology};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MstError {
    #[error(transparent)]
    Slots(#[from] SlotError),
    #[error("MST slot programming failed: {0}")]
    Hardware(#[source] HardwareError),
}

pub struct MstCoordinator {
    topology: Option<Arc<dyn MstTopology>>,
    active: bool,
    slots: SlotAllocator,
}

impl MstCoordinator {
    pub fn new(topology: Option<Arc<dyn MstTopology>>) -> Self {
        Self {
            topology,
            active: false,
            slots: SlotAllocator::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The topology callback set, only while MST is active.
    pub fn active_topology(&self) -> Option<Arc<dyn MstTopology>> {
        if self.active {
            self.topology.clone()
        } else {
            None
        }
    }

    /// Puts the topology manager in MST mode.  Returns `false` when this
    /// source has no topology manager.
    pub fn activate(&mut self) -> Result<bool, HardwareError> {
        let Some(topology) = &self.topology else {
            return Ok(false);
        };
        topology.set_mgr_state(true)?;
        self.active = true;
        info!("MST topology manager active");
        Ok(true)
    }

    /// Unprograms every slot range, then takes the topology manager out of
    /// MST mode.  Best-effort.
    pub fn deactivate(&mut self, controller: &dyn LinkController) {
        if !self.active {
            return;
        }
        let streams: Vec<StreamId> = self.slots.allocations().iter().map(|a| a.stream).collect();
        for stream in streams {
            self.release(controller, stream);
        }
        if let Some(topology) = &self.topology {
            if let Err(e) = topology.set_mgr_state(false) {
                warn!("MST manager shutdown failed: {e}");
            }
        }
        self.slots.clear();
        self.active = false;
        info!("MST topology manager inactive");
    }

    /// Allocates a slot range for `stream` and programs both the controller
    /// and the topology manager.  On failure nothing stays allocated.
    pub fn program(
        &mut self,
        controller: &dyn LinkController,
        stream: StreamId,
        slot_count: u8,
    ) -> Result<SlotAllocation, MstError> {
        let allocation = self.slots.allocate(stream, slot_count)?;
        let programmed = controller
            .set_stream_slots(stream, allocation.start_slot, allocation.slot_count)
            .and_then(|()| match &self.topology {
                Some(t) => t.set_mode_params(stream, allocation.start_slot, allocation.slot_count),
                None => Ok(()),
            });
        if let Err(e) = programmed {
            self.slots.release(stream);
            return Err(MstError::Hardware(e));
        }
        info!(
            %stream,
            start_slot = allocation.start_slot,
            slot_count = allocation.slot_count,
            "MST slots programmed"
        );
        Ok(allocation)
    }

    /// Frees and unprograms the slot range of `stream`.  Best-effort.
    pub fn release(&mut self, controller: &dyn LinkController, stream: StreamId) {
        if self.slots.release(stream).is_none() {
            return;
        }
        if let Err(e) = controller.set_stream_slots(stream, 0, 0) {
            warn!(%stream, "clearing MST slots failed: {e}");
        }
        if let Some(topology) = &self.topology {
            if let Err(e) = topology.set_mode_params(stream, 0, 0) {
                warn!(%stream, "clearing MST mode params failed: {e}");
            }
        }
    }

    /// Forwards a sideband interrupt to the topology manager.
    pub fn hpd_irq(&self) {
        if let Some(topology) = self.active_topology() {
            if let Err(e) = topology.hpd_irq() {
                warn!("MST hpd_irq failed: {e}");
            }
        }
    }

    pub fn allocations(&self) -> &[SlotAllocation] {
        self.slots.allocations()
    }

    pub fn free_slots(&self) -> u8 {
        self.slots.free_slots()
    }
}

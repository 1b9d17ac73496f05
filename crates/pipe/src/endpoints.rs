//! Endpoint enumeration
//!
//! Discovers the bulk pipes of a device interface and pairs them into logical
//! endpoints. Logical endpoint 0 is the implicit control endpoint; endpoints
//! `1..=MAX_ENDPOINTS` each carry one bulk IN and one bulk OUT pipe. Pipe `p`
//! belongs to logical endpoint `(p - 1) / 2 + 1`.
//!
//! Enumeration is fail-fast: the first pipe that is not a bulk pipe, or that
//! has no usable direction, aborts the whole query and no table is returned.

use crate::error::{PipeError, Result};
use crate::usb::{PipeDirection, PipeRef, PipeType, UsbInterface};
use tracing::{debug, error, warn};

/// Maximum number of logical endpoints (without endpoint 0)
pub const MAX_ENDPOINTS: u8 = 8;

/// One direction of a logical endpoint (`pipe_ref == 0` means not present)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeProps {
    pub pipe_ref: PipeRef,
    pub packet_size: u16,
}

impl PipeProps {
    pub fn is_present(&self) -> bool {
        self.pipe_ref != 0
    }
}

/// Bulk IN/OUT pipe pair behind one logical endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub pipe_in: PipeProps,
    pub pipe_out: PipeProps,
}

/// Endpoint table of an opened device interface, immutable once built
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoints {
    num_endpoints: u8,
    endpoint: [Endpoint; MAX_ENDPOINTS as usize],
}

fn pipe_to_slot(pipe: PipeRef) -> usize {
    (pipe as usize - 1) >> 1
}

/// Query the pipes of `interface` and build its endpoint table
///
/// # Errors
///
/// - `Usb` with the platform error if any pipe query fails
/// - `NotSupported` if a pipe is not a bulk pipe
/// - `IllegalParameter` if a pipe is neither IN nor OUT
pub fn query_endpoints<I: UsbInterface + ?Sized>(interface: &I) -> Result<Endpoints> {
    let num_pipes = interface.num_pipes().map_err(|e| {
        error!("Unable to read number of endpoints: {}", e);
        PipeError::Usb(e)
    })?;

    let mut endpoints = Endpoints {
        // Pipes come in IN/OUT pairs, plus endpoint 0
        num_endpoints: num_pipes / 2 + 1,
        ..Endpoints::default()
    };

    for pipe in 1..=num_pipes {
        let slot = pipe_to_slot(pipe);
        if slot >= MAX_ENDPOINTS as usize {
            warn!(
                "Ignoring pipes #{}..#{}, only {} endpoints supported",
                pipe, num_pipes, MAX_ENDPOINTS
            );
            break;
        }

        let transfer_type = interface.pipe_transfer_type(pipe).map_err(|e| {
            error!("Unable to read transfer type of pipe #{}: {}", pipe, e);
            PipeError::Usb(e)
        })?;
        if transfer_type != PipeType::Bulk {
            error!("Wrong transfer type of pipe #{} ({:?})", pipe, transfer_type);
            return Err(PipeError::NotSupported(format!(
                "pipe #{} is a {:?} pipe, only bulk pipes are supported",
                pipe, transfer_type
            )));
        }

        let direction = interface.pipe_direction(pipe).map_err(|e| {
            error!("Unable to read transfer direction of pipe #{}: {}", pipe, e);
            PipeError::Usb(e)
        })?;
        let entry = &mut endpoints.endpoint[slot];
        let props = match direction {
            PipeDirection::In => &mut entry.pipe_in,
            PipeDirection::Out => &mut entry.pipe_out,
            other => {
                error!("Wrong transfer direction of pipe #{} ({:?})", pipe, other);
                return Err(PipeError::IllegalParameter(format!(
                    "pipe #{} has direction {:?}",
                    pipe, other
                )));
            }
        };

        let packet_size = interface.pipe_max_packet_size(pipe).map_err(|e| {
            error!("Unable to read packet size of pipe #{}: {}", pipe, e);
            PipeError::Usb(e)
        })?;
        if props.is_present() {
            warn!(
                "Pipe #{} replaces pipe #{} as {:?} pipe of endpoint {}",
                pipe,
                props.pipe_ref,
                direction,
                slot + 1
            );
        }
        *props = PipeProps {
            pipe_ref: pipe,
            packet_size,
        };
        debug!(
            "Endpoint {}: bulk {:?} pipe #{} ({} bytes)",
            slot + 1,
            direction,
            pipe,
            packet_size
        );
    }

    Ok(endpoints)
}

impl Endpoints {
    /// Number of logical endpoints including endpoint 0
    pub fn num_endpoints(&self) -> u8 {
        self.num_endpoints
    }

    /// Pipe pair of logical endpoint `number` (1-based)
    pub fn endpoint(&self, number: u8) -> Option<&Endpoint> {
        if (1..=MAX_ENDPOINTS).contains(&number) {
            Some(&self.endpoint[number as usize - 1])
        } else {
            None
        }
    }

    /// Bulk IN pipe of an endpoint, 0 if absent or out of range
    pub fn pipe_ref_in(&self, number: u8) -> PipeRef {
        self.endpoint(number).map_or(0, |e| e.pipe_in.pipe_ref)
    }

    /// Bulk OUT pipe of an endpoint, 0 if absent or out of range
    pub fn pipe_ref_out(&self, number: u8) -> PipeRef {
        self.endpoint(number).map_or(0, |e| e.pipe_out.pipe_ref)
    }

    pub fn packet_size_in(&self, number: u8) -> u16 {
        self.endpoint(number).map_or(0, |e| e.pipe_in.packet_size)
    }

    pub fn packet_size_out(&self, number: u8) -> u16 {
        self.endpoint(number).map_or(0, |e| e.pipe_out.packet_size)
    }

    /// Logical endpoints that have at least one pipe, with their numbers
    pub fn iter(&self) -> impl Iterator<Item = (u8, &Endpoint)> + '_ {
        self.endpoint
            .iter()
            .enumerate()
            .filter(|(_, e)| e.pipe_in.is_present() || e.pipe_out.is_present())
            .map(|(i, e)| (i as u8 + 1, e))
    }
}

//! Platform USB layer
//!
//! The pipe runtime never talks to hardware directly. Everything it needs from
//! the platform is behind [`UsbInterface`]: per-pipe metadata queries for the
//! endpoint enumerator and synchronous bulk transfers for the read pump.
//!
//! Pipes are numbered `1..=num_pipes` in the order the endpoints appear in the
//! interface descriptor, so pipe 1 and 2 are the first endpoint pair.
//!
//! [`RusbInterface`] implements the trait on top of libusb via `rusb`.

use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::time::Duration;
use tracing::{debug, warn};

/// Platform pipe reference (1-based, 0 means "no pipe")
pub type PipeRef = u8;

/// Transfer type of a pipe as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    Any,
}

impl From<rusb::TransferType> for PipeType {
    fn from(transfer_type: rusb::TransferType) -> Self {
        match transfer_type {
            rusb::TransferType::Control => PipeType::Control,
            rusb::TransferType::Isochronous => PipeType::Isochronous,
            rusb::TransferType::Bulk => PipeType::Bulk,
            rusb::TransferType::Interrupt => PipeType::Interrupt,
        }
    }
}

/// Transfer direction of a pipe as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    Out,
    In,
    None,
    Any,
}

impl From<rusb::Direction> for PipeDirection {
    fn from(direction: rusb::Direction) -> Self {
        match direction {
            rusb::Direction::In => PipeDirection::In,
            rusb::Direction::Out => PipeDirection::Out,
        }
    }
}

/// One claimed USB interface of an opened device
pub trait UsbInterface: Send + Sync {
    /// Number of pipes of the interface (endpoint 0 not included)
    fn num_pipes(&self) -> Result<u8, rusb::Error>;

    fn pipe_transfer_type(&self, pipe: PipeRef) -> Result<PipeType, rusb::Error>;

    fn pipe_direction(&self, pipe: PipeRef) -> Result<PipeDirection, rusb::Error>;

    fn pipe_max_packet_size(&self, pipe: PipeRef) -> Result<u16, rusb::Error>;

    /// Synchronous bulk IN transfer, returns the number of bytes received
    fn read_pipe(
        &self,
        pipe: PipeRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error>;

    /// Synchronous bulk OUT transfer, returns the number of bytes sent
    fn write_pipe(&self, pipe: PipeRef, buf: &[u8], timeout: Duration)
    -> Result<usize, rusb::Error>;
}

/// Cached endpoint descriptor fields
#[derive(Debug, Clone, Copy)]
struct PipeInfo {
    address: u8,
    transfer_type: rusb::TransferType,
    direction: rusb::Direction,
    max_packet_size: u16,
}

/// [`UsbInterface`] over a libusb device handle
pub struct RusbInterface {
    handle: DeviceHandle<Context>,
    interface: u8,
    pipes: Vec<PipeInfo>,
}

impl RusbInterface {
    /// Open the first device matching `vendor_id:product_id` and claim `interface`
    pub fn open(
        context: &Context,
        vendor_id: u16,
        product_id: u16,
        interface: u8,
    ) -> Result<Self, rusb::Error> {
        let handle = context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(rusb::Error::NotFound)?;
        Self::claim(handle, interface)
    }

    /// Claim `interface` on an already opened device
    ///
    /// Caches the endpoint descriptors of the interface's first alternate
    /// setting; their order defines the pipe numbering.
    pub fn claim(mut handle: DeviceHandle<Context>, interface: u8) -> Result<Self, rusb::Error> {
        let device = handle.device();
        let pipes = read_pipes(&device, interface)?;

        // Not supported on every platform, claiming may still succeed
        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Auto-detach of kernel driver unavailable: {}", e);
        }
        handle.claim_interface(interface)?;

        debug!(
            "Claimed interface {} on device {:03}:{:03} with {} pipes",
            interface,
            device.bus_number(),
            device.address(),
            pipes.len()
        );

        Ok(Self {
            handle,
            interface,
            pipes,
        })
    }

    pub fn interface_number(&self) -> u8 {
        self.interface
    }

    /// Endpoint address (with direction bit) backing a pipe
    pub fn endpoint_address(&self, pipe: PipeRef) -> Result<u8, rusb::Error> {
        self.pipe(pipe).map(|p| p.address)
    }

    fn pipe(&self, pipe: PipeRef) -> Result<&PipeInfo, rusb::Error> {
        if pipe == 0 {
            return Err(rusb::Error::InvalidParam);
        }
        self.pipes
            .get(pipe as usize - 1)
            .ok_or(rusb::Error::InvalidParam)
    }
}

fn read_pipes(device: &Device<Context>, interface: u8) -> Result<Vec<PipeInfo>, rusb::Error> {
    let config = device.active_config_descriptor()?;
    let descriptor = config
        .interfaces()
        .find(|i| i.number() == interface)
        .and_then(|i| i.descriptors().next())
        .ok_or(rusb::Error::NotFound)?;

    Ok(descriptor
        .endpoint_descriptors()
        .map(|ep| PipeInfo {
            address: ep.address(),
            transfer_type: ep.transfer_type(),
            direction: ep.direction(),
            max_packet_size: ep.max_packet_size(),
        })
        .collect())
}

impl UsbInterface for RusbInterface {
    fn num_pipes(&self) -> Result<u8, rusb::Error> {
        u8::try_from(self.pipes.len()).map_err(|_| rusb::Error::Overflow)
    }

    fn pipe_transfer_type(&self, pipe: PipeRef) -> Result<PipeType, rusb::Error> {
        self.pipe(pipe).map(|p| p.transfer_type.into())
    }

    fn pipe_direction(&self, pipe: PipeRef) -> Result<PipeDirection, rusb::Error> {
        self.pipe(pipe).map(|p| p.direction.into())
    }

    fn pipe_max_packet_size(&self, pipe: PipeRef) -> Result<u16, rusb::Error> {
        self.pipe(pipe).map(|p| p.max_packet_size)
    }

    fn read_pipe(
        &self,
        pipe: PipeRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let address = self.pipe(pipe)?.address;
        self.handle.read_bulk(address, buf, timeout)
    }

    fn write_pipe(
        &self,
        pipe: PipeRef,
        buf: &[u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        let address = self.pipe(pipe)?.address;
        self.handle.write_bulk(address, buf, timeout)
    }
}

impl Drop for RusbInterface {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        } else {
            debug!("Released interface {}", self.interface);
        }
    }
}

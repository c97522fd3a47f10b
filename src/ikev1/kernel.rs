use std::{error, fmt, net::SocketAddr};

use log::{debug, info};

use super::crypto::{EncapsulationMode, IpsecProtocol};
use super::proposal::{Lifetimes, SaTransform};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Byte counter of a single SA, as reported by the kernel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SaStats {
    pub spi: u32,
    pub bytes: u64,
}

#[derive(Clone, Debug)]
pub struct SaEntry {
    pub direction: Direction,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub protocol: IpsecProtocol,
    pub mode: EncapsulationMode,
    pub spi: u32,
    pub transform: SaTransform,
    pub lifetimes: Lifetimes,
}

/// Kernel key table: installs, deletes and reports on IPsec SAs.
pub trait KernelSa {
    fn push_sa(&mut self, sa: &SaEntry) -> Result<(), KernelError>;

    fn delete_sa(
        &mut self,
        protocol: IpsecProtocol,
        mode: Option<EncapsulationMode>,
        src: SocketAddr,
        dst: SocketAddr,
        spi: u32,
    ) -> Result<(), KernelError>;

    fn poll_stats(&mut self, direction: Direction, spis: &[u32])
        -> Result<Vec<SaStats>, KernelError>;
}

/// Records requests in the log only; used when no kernel interface is configured.
pub struct LoggingKernel {}

impl KernelSa for LoggingKernel {
    fn push_sa(&mut self, sa: &SaEntry) -> Result<(), KernelError> {
        info!(
            "Installing {} {} SA {:08x} {} -> {} mode {:?}",
            sa.direction, sa.protocol, sa.spi, sa.src, sa.dst, sa.mode
        );
        Ok(())
    }

    fn delete_sa(
        &mut self,
        protocol: IpsecProtocol,
        mode: Option<EncapsulationMode>,
        src: SocketAddr,
        dst: SocketAddr,
        spi: u32,
    ) -> Result<(), KernelError> {
        info!(
            "Deleting {} SA {:08x} {} -> {} mode {:?}",
            protocol, spi, src, dst, mode
        );
        Ok(())
    }

    fn poll_stats(
        &mut self,
        direction: Direction,
        spis: &[u32],
    ) -> Result<Vec<SaStats>, KernelError> {
        debug!("Polling {} stats for {} SAs", direction, spis.len());
        Ok(spis.iter().map(|spi| SaStats { spi: *spi, bytes: 0 }).collect())
    }
}

#[derive(Debug)]
pub enum KernelError {
    Internal(&'static str),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Internal(msg) => f.write_str(msg),
        }
    }
}

impl error::Error for KernelError {}

impl From<&'static str> for KernelError {
    fn from(msg: &'static str) -> KernelError {
        Self::Internal(msg)
    }
}

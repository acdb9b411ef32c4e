//! Solenoid bank — valve channel state and the GPIO driver seam.

use std::sync::Arc;

use dashmap::DashMap;

/// Drives the actual valve hardware. GPIO wiring lives outside this crate.
pub trait SolenoidDriver: Send + Sync {
    /// Energize or release one channel.
    fn set(&self, channel: u8, open: bool) -> anyhow::Result<()>;
}

/// Tracks desired valve state and pushes it to the driver.
pub struct SolenoidBank {
    driver: Arc<dyn SolenoidDriver>,
    channel_count: usize,
    /// channel → open. Absent means closed.
    state: DashMap<u8, bool>,
}

impl SolenoidBank {
    pub fn new(driver: Arc<dyn SolenoidDriver>, channel_count: usize) -> Self {
        Self {
            driver,
            channel_count,
            state: DashMap::new(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Open or close a valve. Out-of-range channels are refused.
    pub fn set(&self, channel: u8, open: bool) -> anyhow::Result<()> {
        if channel as usize >= self.channel_count {
            anyhow::bail!("channel {channel} out of range");
        }
        self.driver.set(channel, open)?;
        self.state.insert(channel, open);
        tracing::info!(channel, open, "valve state changed");
        Ok(())
    }

    pub fn is_open(&self, channel: u8) -> bool {
        self.state.get(&channel).map(|v| *v).unwrap_or(false)
    }

    /// Close every channel (shutdown path).
    pub fn close_all(&self) {
        for channel in 0..self.channel_count as u8 {
            if self.is_open(channel) {
                if let Err(e) = self.set(channel, false) {
                    tracing::warn!(channel, error = %e, "failed to close valve");
                }
            }
        }
    }
}

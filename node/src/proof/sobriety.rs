//! Proof of Sobriety: energy attestations over explicit measurement
//! windows, compared against a fixed datacenter GPU baseline.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::{Hash256, unix_now};

/// Reference energy per inference on a datacenter GPU.
pub const GPU_BASELINE_MJ: u64 = 150;
/// Fallback estimate per inference when no hardware counter is readable.
pub const FALLBACK_INFERENCE_MJ: f64 = 28.0;
/// Assumed idle draw of the host, in milliwatts.
pub const FALLBACK_IDLE_MW: f64 = 5_000.0;
/// Share of the idle draw attributed to inference work.
pub const FALLBACK_IDLE_SHARE: f64 = 0.1;
/// Grams of CO2 avoided per millijoule saved.
pub const CO2_GRAMS_PER_MJ: f64 = 0.0004;

pub const RAPL_ENERGY_PATH: &str = "/sys/class/powercap/intel-rapl:0/energy_uj";

/// Source of a monotonically increasing energy reading, in millijoules.
pub trait EnergyCounter: Send + Sync {
    /// Returns `None` when no reading is available.
    fn read_mj(&self) -> Option<f64>;
}

/// Intel RAPL package counter (reported in microjoules).
#[derive(Clone, Debug)]
pub struct RaplEnergyCounter {
    path: PathBuf,
}

impl RaplEnergyCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for RaplEnergyCounter {
    fn default() -> Self {
        Self::new(RAPL_ENERGY_PATH)
    }
}

impl EnergyCounter for RaplEnergyCounter {
    fn read_mj(&self) -> Option<f64> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let micro_joules: u64 = raw.trim().parse().ok()?;
        Some(micro_joules as f64 / 1000.0)
    }
}

/// Counter that never has a reading; forces the time-based estimate.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEnergyCounter;

impl EnergyCounter for NoEnergyCounter {
    fn read_mj(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SobrietyError {
    /// `end_measurement` called without a matching `start_measurement`.
    NotStarted,
}

impl fmt::Display for SobrietyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SobrietyError::NotStarted => {
                write!(f, "no measurement in progress; call start_measurement first")
            }
        }
    }
}

impl std::error::Error for SobrietyError {}

/// Letter grade of energy per inference against the GPU baseline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfficiencyRating {
    NotApplicable,
    APlus,
    A,
    B,
    C,
    D,
}

impl EfficiencyRating {
    pub fn from_energy_per_inference(mj: f64) -> Self {
        if mj <= 0.0 {
            EfficiencyRating::NotApplicable
        } else if mj < 30.0 {
            EfficiencyRating::APlus
        } else if mj < 50.0 {
            EfficiencyRating::A
        } else if mj < 100.0 {
            EfficiencyRating::B
        } else if mj < GPU_BASELINE_MJ as f64 {
            EfficiencyRating::C
        } else {
            EfficiencyRating::D
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EfficiencyRating::NotApplicable => "N/A",
            EfficiencyRating::APlus => "A+ (Exceptional)",
            EfficiencyRating::A => "A (Excellent)",
            EfficiencyRating::B => "B (Good)",
            EfficiencyRating::C => "C (Average - GPU baseline)",
            EfficiencyRating::D => "D (Below average)",
        }
    }
}

impl fmt::Display for EfficiencyRating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Energy consumed by one node over one measurement window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SobrietyAttestation {
    pub node_id: String,
    pub period_start: f64,
    pub period_end: f64,
    pub total_inferences: u64,
    pub total_energy_mj: u64,
    pub hardware_type: String,
    pub os_info: String,
}

impl SobrietyAttestation {
    pub fn energy_per_inference_mj(&self) -> f64 {
        if self.total_inferences == 0 {
            return 0.0;
        }
        self.total_energy_mj as f64 / self.total_inferences as f64
    }

    pub fn efficiency_rating(&self) -> EfficiencyRating {
        EfficiencyRating::from_energy_per_inference(self.energy_per_inference_mj())
    }

    pub fn to_hash(&self) -> Hash256 {
        let cfg = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(self, cfg).unwrap_or_default();
        Hash256::compute(&bytes)
    }
}

/// Network-wide comparison against the GPU baseline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkSavings {
    pub total_inferences: u64,
    pub aria_energy_mj: u64,
    pub gpu_equivalent_mj: u64,
    pub energy_saved_mj: u64,
    pub savings_percent: f64,
    pub co2_saved_grams: f64,
}

struct Window {
    started_at: f64,
    energy_start_mj: Option<f64>,
}

pub struct ProofOfSobriety {
    node_id: String,
    counter: Box<dyn EnergyCounter>,
    window: Option<Window>,
    attestations: Vec<SobrietyAttestation>,
}

impl ProofOfSobriety {
    /// Uses the RAPL counter, falling back to estimates when unreadable.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self::with_counter(node_id, Box::new(RaplEnergyCounter::default()))
    }

    pub fn with_counter(node_id: impl Into<String>, counter: Box<dyn EnergyCounter>) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
            window: None,
            attestations: Vec::new(),
        }
    }

    pub fn is_measuring(&self) -> bool {
        self.window.is_some()
    }

    pub fn attestations(&self) -> &[SobrietyAttestation] {
        &self.attestations
    }

    pub fn start_measurement(&mut self) {
        self.start_measurement_at(unix_now());
    }

    /// Opens a window at `now`, replacing any window already open.
    pub fn start_measurement_at(&mut self, now: f64) {
        let energy_start_mj = self.counter.read_mj();
        debug!(node_id = %self.node_id, hardware_counter = energy_start_mj.is_some(), "sobriety window opened");
        self.window = Some(Window {
            started_at: now,
            energy_start_mj,
        });
    }

    pub fn end_measurement(
        &mut self,
        inferences_done: u64,
    ) -> Result<SobrietyAttestation, SobrietyError> {
        self.end_measurement_at(inferences_done, unix_now())
    }

    /// Closes the open window and records an attestation.
    pub fn end_measurement_at(
        &mut self,
        inferences_done: u64,
        now: f64,
    ) -> Result<SobrietyAttestation, SobrietyError> {
        let window = self.window.take().ok_or(SobrietyError::NotStarted)?;
        let elapsed = (now - window.started_at).max(0.0);

        let measured = match (window.energy_start_mj, self.counter.read_mj()) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        };
        let energy_mj = measured.unwrap_or_else(|| estimate_energy_mj(elapsed, inferences_done));

        let attestation = SobrietyAttestation {
            node_id: self.node_id.clone(),
            period_start: window.started_at,
            period_end: now,
            total_inferences: inferences_done,
            total_energy_mj: energy_mj.max(0.0) as u64,
            hardware_type: hardware_type(),
            os_info: os_info(),
        };
        info!(
            node_id = %self.node_id,
            inferences = inferences_done,
            energy_mj = attestation.total_energy_mj,
            rating = %attestation.efficiency_rating(),
            "sobriety attestation recorded"
        );
        self.attestations.push(attestation.clone());
        Ok(attestation)
    }

    /// Savings across all attestations; `None` before the first one.
    pub fn get_network_savings(&self) -> Option<NetworkSavings> {
        if self.attestations.is_empty() {
            return None;
        }
        let total_inferences: u64 = self.attestations.iter().map(|a| a.total_inferences).sum();
        let aria_energy_mj: u64 = self.attestations.iter().map(|a| a.total_energy_mj).sum();
        let gpu_equivalent_mj = total_inferences * GPU_BASELINE_MJ;
        let energy_saved_mj = gpu_equivalent_mj.saturating_sub(aria_energy_mj);
        let savings_percent = if gpu_equivalent_mj > 0 {
            (energy_saved_mj as f64 / gpu_equivalent_mj as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        Some(NetworkSavings {
            total_inferences,
            aria_energy_mj,
            gpu_equivalent_mj,
            energy_saved_mj,
            savings_percent,
            co2_saved_grams: energy_saved_mj as f64 * CO2_GRAMS_PER_MJ,
        })
    }
}

/// Time-based estimate used without a hardware counter.
pub fn estimate_energy_mj(elapsed_secs: f64, inferences: u64) -> f64 {
    inferences as f64 * FALLBACK_INFERENCE_MJ + elapsed_secs * FALLBACK_IDLE_MW * FALLBACK_IDLE_SHARE
}

fn hardware_type() -> String {
    std::fs::read_to_string("/proc/cpuinfo")
        .ok()
        .and_then(|info| {
            info.lines()
                .find(|l| l.starts_with("model name"))
                .and_then(|l| l.split_once(':'))
                .map(|(_, name)| name.trim().to_string())
        })
        .unwrap_or_else(|| std::env::consts::ARCH.to_string())
}

fn os_info() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

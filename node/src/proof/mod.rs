//! Work and energy proofs consumed from completed inferences.

pub mod sobriety;
pub mod useful_work;

pub use sobriety::{
    EfficiencyRating, EnergyCounter, NetworkSavings, NoEnergyCounter, ProofOfSobriety,
    RaplEnergyCounter, SobrietyAttestation, SobrietyError,
};
pub use useful_work::{ProofOfUsefulWork, ProofRejection, UsefulWorkProof};

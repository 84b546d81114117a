//! Generated protobuf/tonic bindings.
//!
//! Two packages: `brain.v1` is the surface this service serves,
//! `soul.v1` is the collaborator contract this service consumes.

/// Brain's external RPC surface.
pub mod brain {
    /// Versioned package namespace matching `proto/brain.proto`.
    #[allow(
        missing_docs,
        clippy::arithmetic_side_effects,
        clippy::cast_lossless,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::unwrap_used
    )]
    pub mod v1 {
        tonic::include_proto!("brain.v1");
    }
    pub use v1::*;
}

/// Soul collaborator contract.
pub mod soul {
    /// Versioned package namespace matching `proto/soul.proto`.
    #[allow(
        missing_docs,
        clippy::arithmetic_side_effects,
        clippy::cast_lossless,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::unwrap_used
    )]
    pub mod v1 {
        tonic::include_proto!("soul.v1");
    }
    pub use v1::*;
}

//! The detection module splits a deployment payload into constructor, runtime and trailing data.

pub mod sections;

pub use sections::{
    DeploymentSplit, Section, SectionKind, detect_auxdata, detect_deployment, locate_sections,
    validate_sections,
};

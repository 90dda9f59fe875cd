use crate::{Error, Result};
use kube::api::DynamicObject;
use semver::{Prerelease, Version, VersionReq};
use std::sync::Arc;
use tracing::*;

/// Builds some of the objects required by a target from its context
pub trait ResourceGenerator<C>: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, context: &C) -> Result<Vec<DynamicObject>>;
}

/// Registry of generators by operator version range.
///
/// Ranges are checked in registration order, the first one matching the version the
/// target was created with provides the generators.
pub struct ResourceGenerationDiscoverer<C> {
    generators: Vec<(VersionReq, Vec<Arc<dyn ResourceGenerator<C>>>)>,
}

impl<C> Default for ResourceGenerationDiscoverer<C> {
    fn default() -> Self {
        Self { generators: vec![] }
    }
}

impl<C> ResourceGenerationDiscoverer<C> {
    pub fn register(mut self, range: &str, generators: Vec<Arc<dyn ResourceGenerator<C>>>) -> Result<Self> {
        let range = VersionReq::parse(range)
            .map_err(|e| Error::InvalidErr(format!("invalid version range {range}: {e}")))?;
        self.generators.push((range, generators));
        Ok(self)
    }

    pub fn generators_for(&self, version: &str) -> Result<&[Arc<dyn ResourceGenerator<C>>]> {
        let mut parsed = Version::parse(version)
            .map_err(|e| Error::InvalidErr(format!("invalid operator version {version}: {e}")))?;
        // development builds resolve like their release
        parsed.pre = Prerelease::EMPTY;
        self.generators
            .iter()
            .find(|(range, _)| range.matches(&parsed))
            .map(|(_, generators)| generators.as_slice())
            .ok_or_else(|| {
                Error::MissingCollaborator(format!("no resource generators for operator version {version}"))
            })
    }

    /// Run every generator registered for `version`, the first failure aborts generation
    pub fn generate(&self, version: &str, context: &C) -> Result<Vec<DynamicObject>> {
        let mut resources = vec![];
        for generator in self.generators_for(version)? {
            trace!("Running generator {}", generator.name());
            let generated = generator.generate(context).map_err(|e| {
                Error::ResourceGenerationError(format!("{} failed: {}", generator.name(), e))
            })?;
            resources.extend(generated);
        }
        Ok(resources)
    }
}

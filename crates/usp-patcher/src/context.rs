//! Execution context
//!
//! Holds the bind-time state a caller sets up before finalising shaders:
//! texture-unit hints, the result location and the prologue budget.

use crate::finalise::{finalise, FinaliseParams, HwShader};
use crate::graph::ShaderGraph;
use crate::result::ResultLocation;
use crate::texture::TextureControl;
use usp_core::config::PatcherConfig;
use usp_core::error::{FinaliseError, Result};

pub struct UspContext {
    config: PatcherConfig,
    textures: Vec<Option<TextureControl>>,
    result_location: ResultLocation,
    prologue_budget: usize,
}

impl UspContext {
    pub fn new(config: &PatcherConfig) -> Self {
        tracing::debug!(
            "Creating patcher context: {} texture units, prologue budget {}",
            config.max_texture_units,
            config.default_prologue_budget
        );
        Self {
            config: config.clone(),
            textures: vec![None; config.max_texture_units as usize],
            result_location: ResultLocation::Default,
            prologue_budget: config.default_prologue_budget as usize,
        }
    }

    /// Build a shader graph from container bytes
    pub fn create_shader(&self, data: &[u8]) -> Result<ShaderGraph> {
        ShaderGraph::from_bytes(data)
    }

    pub fn set_texture_control(&mut self, unit: u16, control: TextureControl) -> Result<()> {
        let max = self.config.max_texture_units;
        let Some(slot) = self.textures.get_mut(unit as usize) else {
            return Err(FinaliseError::TextureUnit { unit, max }.into());
        };
        *slot = Some(control);
        Ok(())
    }

    pub fn texture_control(&self, unit: u16) -> Option<TextureControl> {
        self.textures.get(unit as usize).copied().flatten()
    }

    pub fn clear_texture_controls(&mut self) {
        self.textures.iter_mut().for_each(|t| *t = None);
    }

    pub fn set_result_location(&mut self, location: ResultLocation) {
        self.result_location = location;
    }

    pub fn result_location(&self) -> ResultLocation {
        self.result_location
    }

    pub fn set_prologue_budget(&mut self, budget: usize) {
        self.prologue_budget = budget;
    }

    pub fn prologue_budget(&self) -> usize {
        self.prologue_budget
    }

    /// Produce hardware-ready code with the current settings
    pub fn finalise(&self, graph: &ShaderGraph) -> Result<HwShader> {
        finalise(
            graph,
            &FinaliseParams {
                textures: &self.textures,
                result_location: self.result_location,
                prologue_budget: self.prologue_budget,
                texture_state_words: self.config.texture_state_words,
            },
        )
    }

    /// Serialise a graph back into a container
    pub fn write_shader(&self, graph: &ShaderGraph) -> Result<Vec<u8>> {
        graph.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TextureFormat;
    use usp_core::error::UspError;

    #[test]
    fn test_texture_unit_range() {
        let config = PatcherConfig {
            max_texture_units: 2,
            ..Default::default()
        };
        let mut ctx = UspContext::new(&config);
        let control = TextureControl::new(TextureFormat::U8888);
        ctx.set_texture_control(1, control).unwrap();
        assert_eq!(ctx.texture_control(1), Some(control));

        let err = ctx.set_texture_control(2, control).unwrap_err();
        assert!(matches!(
            err,
            UspError::Finalise(FinaliseError::TextureUnit { unit: 2, max: 2 })
        ));

        ctx.clear_texture_controls();
        assert_eq!(ctx.texture_control(1), None);
    }

    #[test]
    fn test_defaults_come_from_config() {
        let ctx = UspContext::new(&PatcherConfig::default());
        assert_eq!(ctx.prologue_budget(), 8);
        assert_eq!(ctx.result_location(), ResultLocation::Default);
    }
}

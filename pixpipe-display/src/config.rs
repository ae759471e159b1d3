//! Configuration types for the presenter.

use crate::dirty::MIN_DIRTY_CAPACITY;
use crate::error::{DisplayResult, RenderError};
use crate::filter::{Filter, Interpolation, Upscale, UpscaleKind};
use crate::gpu::GlVersion;
use crate::mode::DisplayMode;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete presenter configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PresentConfig {
    /// Renderer selection.
    #[serde(default)]
    pub renderer: RendererConfig,
    /// Image presentation settings.
    #[serde(default)]
    pub image: ImageConfig,
    /// Logical surface settings.
    #[serde(default)]
    pub surface: SurfaceConfig,
}

/// Which presentation strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendererPreference {
    /// Best strategy the device supports.
    #[default]
    Auto,
    Tiled,
    Resample,
    Upscale,
}

/// Renderer configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default)]
    pub preference: RendererPreference,
    /// Treat the device as at most this capable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gl_version: Option<GlVersion>,
    /// Expand RGB565 on the CPU even when the device accepts it natively.
    #[serde(default)]
    pub force_cpu_expansion: bool,
}

/// Per-upscaler factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpscaleFactors {
    #[serde(default = "default_factor")]
    pub scale_nx: u32,
    #[serde(default = "default_factor")]
    pub scale_hq: u32,
    #[serde(default = "default_factor")]
    pub xbrz: u32,
    #[serde(default = "default_factor")]
    pub xsal: u32,
    #[serde(default = "default_factor")]
    pub eagle: u32,
}

fn default_factor() -> u32 {
    2
}

impl UpscaleFactors {
    pub fn get(&self, kind: UpscaleKind) -> u32 {
        match kind {
            UpscaleKind::ScaleNx => self.scale_nx,
            UpscaleKind::ScaleHq => self.scale_hq,
            UpscaleKind::Xbrz => self.xbrz,
            UpscaleKind::Xsal => self.xsal,
            UpscaleKind::Eagle => self.eagle,
        }
    }

    pub fn set(&mut self, kind: UpscaleKind, factor: u32) {
        match kind {
            UpscaleKind::ScaleNx => self.scale_nx = factor,
            UpscaleKind::ScaleHq => self.scale_hq = factor,
            UpscaleKind::Xbrz => self.xbrz = factor,
            UpscaleKind::Xsal => self.xsal = factor,
            UpscaleKind::Eagle => self.eagle = factor,
        }
    }

    /// Largest factor each upscaler has a shader for.
    pub fn supported_maximums() -> Self {
        let mut factors = Self::default();
        for kind in UpscaleKind::ALL {
            let max = kind.supported_factors().iter().copied().max().unwrap_or(2);
            factors.set(kind, max);
        }
        factors
    }
}

impl Default for UpscaleFactors {
    fn default() -> Self {
        Self {
            scale_nx: default_factor(),
            scale_hq: default_factor(),
            xbrz: default_factor(),
            xsal: default_factor(),
            eagle: default_factor(),
        }
    }
}

/// Image configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Wait for vertical sync on present.
    #[serde(default = "default_true")]
    pub vsync: bool,
    /// Keep the surface aspect ratio when the window does not match it.
    #[serde(default = "default_true")]
    pub aspect: bool,
    #[serde(default)]
    pub interpolation: Interpolation,
    /// Active upscaler, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upscale: Option<UpscaleKind>,
    /// Selected factor per upscaler.
    #[serde(default)]
    pub factors: UpscaleFactors,
    /// Upper bound per upscaler.
    #[serde(default = "UpscaleFactors::supported_maximums")]
    pub max_factors: UpscaleFactors,
}

fn default_true() -> bool {
    true
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            aspect: true,
            interpolation: Interpolation::default(),
            upscale: None,
            factors: UpscaleFactors::default(),
            max_factors: UpscaleFactors::supported_maximums(),
        }
    }
}

impl ImageConfig {
    /// Normalize an upscale request against the configured maximum.
    pub fn upscale_for(&self, kind: UpscaleKind, factor: u32) -> Upscale {
        Upscale::new(kind, factor, Some(self.max_factors.get(kind)))
    }

    /// The filter described by this configuration.
    pub fn filter(&self) -> Filter {
        let upscale = self
            .upscale
            .map(|kind| self.upscale_for(kind, self.factors.get(kind)));
        Filter::new(self.interpolation, upscale)
    }
}

/// Logical surface configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceConfig {
    /// Dirty-region ring capacity.
    #[serde(default = "default_dirty_capacity")]
    pub dirty_capacity: usize,
    /// Mode set when the presenter is created.
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

fn default_dirty_capacity() -> usize {
    256
}

fn default_width() -> u32 {
    640
}

fn default_height() -> u32 {
    480
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            dirty_capacity: default_dirty_capacity(),
            width: default_width(),
            height: default_height(),
        }
    }
}

impl PresentConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> PresentConfigBuilder {
        PresentConfigBuilder::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> DisplayResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> DisplayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> DisplayResult<String> {
        toml::to_string_pretty(self).map_err(|e| RenderError::Config(e.to_string()))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> DisplayResult<()> {
        if self.surface.dirty_capacity < MIN_DIRTY_CAPACITY {
            return Err(RenderError::Config(format!(
                "Dirty capacity must be at least {}",
                MIN_DIRTY_CAPACITY
            )));
        }

        DisplayMode::find(self.surface.width, self.surface.height)
            .map_err(|e| RenderError::Config(e.to_string()))?;

        for kind in UpscaleKind::ALL {
            let max = self.image.max_factors.get(kind);
            let smallest = kind.supported_factors()[0];
            if max < smallest {
                return Err(RenderError::Config(format!(
                    "Maximum {} factor {} is below the smallest supported factor {}",
                    kind.name(),
                    max,
                    smallest
                )));
            }
            if self.image.factors.get(kind) == 0 {
                return Err(RenderError::Config(format!(
                    "{} factor cannot be 0",
                    kind.name()
                )));
            }
        }

        Ok(())
    }

    /// The initial display mode.
    pub fn initial_mode(&self) -> DisplayResult<DisplayMode> {
        DisplayMode::find(self.surface.width, self.surface.height)
    }
}

/// Builder for creating a `PresentConfig`.
#[derive(Default)]
pub struct PresentConfigBuilder {
    config: PresentConfig,
}

impl PresentConfigBuilder {
    #[must_use]
    pub fn preference(mut self, preference: RendererPreference) -> Self {
        self.config.renderer.preference = preference;
        self
    }

    #[must_use]
    pub fn gl_version(mut self, version: GlVersion) -> Self {
        self.config.renderer.gl_version = Some(version);
        self
    }

    #[must_use]
    pub fn force_cpu_expansion(mut self, force: bool) -> Self {
        self.config.renderer.force_cpu_expansion = force;
        self
    }

    #[must_use]
    pub fn vsync(mut self, vsync: bool) -> Self {
        self.config.image.vsync = vsync;
        self
    }

    #[must_use]
    pub fn aspect(mut self, aspect: bool) -> Self {
        self.config.image.aspect = aspect;
        self
    }

    #[must_use]
    pub fn interpolation(mut self, interpolation: Interpolation) -> Self {
        self.config.image.interpolation = interpolation;
        self
    }

    /// Select an upscaler and its factor.
    #[must_use]
    pub fn upscale(mut self, kind: UpscaleKind, factor: u32) -> Self {
        self.config.image.upscale = Some(kind);
        self.config.image.factors.set(kind, factor);
        self
    }

    #[must_use]
    pub fn dirty_capacity(mut self, capacity: usize) -> Self {
        self.config.surface.dirty_capacity = capacity;
        self
    }

    #[must_use]
    pub fn mode(mut self, width: u32, height: u32) -> Self {
        self.config.surface.width = width;
        self.config.surface.height = height;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> DisplayResult<PresentConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

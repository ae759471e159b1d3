//! Shader programs and their sources.
//!
//! Sources are looked up through a [`ShaderSourceProvider`] keyed by GLSL
//! dialect, stage and program. [`BuiltinShaders`] supplies the interpolation
//! and stencil programs; pixel-art upscaler sources come from the embedder,
//! usually through a [`ShaderLibrary`].
//!
//! A [`ShaderGroup`] is one compiled program. It is built from a ladder of
//! dialects, highest first, and keeps the first variant that compiles.

use crate::error::{DisplayResult, RenderError};
use crate::filter::{Interpolation, Upscale, UpscaleKind};
use crate::gpu::{GraphicsDevice, ProgramHandle, ProgramSource, Uniforms};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// GLSL dialects, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GlslVersion {
    V110,
    V130,
}

impl GlslVersion {
    pub const ALL: [GlslVersion; 2] = [Self::V110, Self::V130];

    pub fn directive(&self) -> &'static str {
        match self {
            Self::V110 => "#version 110",
            Self::V130 => "#version 130",
        }
    }

    /// Dialects from `preferred` down to the oldest, skipping any above `max`.
    pub fn ladder(preferred: GlslVersion, max: Option<GlslVersion>) -> Vec<GlslVersion> {
        let Some(max) = max else {
            return Vec::new();
        };
        let top = preferred.min(max);
        Self::ALL.iter().rev().copied().filter(|v| *v <= top).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Every program the renderers use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderId {
    Stencil,
    Linear,
    Hermite,
    Cubic,
    Upscale(UpscaleKind, u32),
}

impl ShaderId {
    /// Program that resamples with `interpolation`. Nearest uses the linear
    /// program with point-sampled textures.
    pub fn for_interpolation(interpolation: Interpolation) -> Self {
        match interpolation {
            Interpolation::Nearest | Interpolation::Linear => Self::Linear,
            Interpolation::Hermite => Self::Hermite,
            Interpolation::Cubic => Self::Cubic,
        }
    }

    pub fn for_upscale(upscale: Upscale) -> Self {
        Self::Upscale(upscale.kind, upscale.factor)
    }

    pub fn name(&self) -> String {
        match self {
            Self::Stencil => "stencil".into(),
            Self::Linear => "linear".into(),
            Self::Hermite => "hermite".into(),
            Self::Cubic => "cubic".into(),
            Self::Upscale(kind, factor) => format!("{}{}", kind.name(), factor),
        }
    }
}

impl fmt::Display for ShaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Supplies shader source text.
pub trait ShaderSourceProvider: Send + Sync {
    fn source(&self, version: GlslVersion, stage: ShaderStage, id: ShaderId) -> Option<Cow<'_, str>>;
}

// Attribute 0 is the position, attribute 1 the texture coordinate.
const TEXTURED_VERTEX: &str = r#"
attribute vec4 vCoord;
attribute vec2 vTexCoord;
varying vec2 fTexCoord;

void main() {
    gl_Position = vCoord;
    fTexCoord = vTexCoord;
}
"#;

const STENCIL_VERTEX: &str = r#"
attribute vec2 vCoord;
uniform mat4 mvp;

void main() {
    gl_Position = mvp * vec4(vCoord, 0.0, 1.0);
}
"#;

const STENCIL_FRAGMENT: &str = r#"
void main() {
    gl_FragColor = vec4(1.0);
}
"#;

const LINEAR_FRAGMENT: &str = r#"
uniform sampler2D tex01;
varying vec2 fTexCoord;

void main() {
    gl_FragColor = texture2D(tex01, fTexCoord);
}
"#;

const HERMITE_FRAGMENT: &str = r#"
uniform sampler2D tex01;
uniform vec2 texSize;
varying vec2 fTexCoord;

void main() {
    vec2 p = fTexCoord * texSize;
    vec2 i = floor(p - 0.5) + 0.5;
    vec2 f = p - i;
    f = f * f * (3.0 - 2.0 * f);
    gl_FragColor = texture2D(tex01, (i + f) / texSize);
}
"#;

const CUBIC_FRAGMENT: &str = r#"
uniform sampler2D tex01;
uniform vec2 texSize;
varying vec2 fTexCoord;

vec4 weights(float f) {
    return vec4(
        f * (-0.5 + f * (1.0 - 0.5 * f)),
        1.0 + f * f * (-2.5 + 1.5 * f),
        f * (0.5 + f * (2.0 - 1.5 * f)),
        f * f * (-0.5 + 0.5 * f));
}

vec4 row(vec2 base, float y, vec4 wx) {
    return texture2D(tex01, (base + vec2(-1.0, y)) / texSize) * wx.x
         + texture2D(tex01, (base + vec2( 0.0, y)) / texSize) * wx.y
         + texture2D(tex01, (base + vec2( 1.0, y)) / texSize) * wx.z
         + texture2D(tex01, (base + vec2( 2.0, y)) / texSize) * wx.w;
}

void main() {
    vec2 p = fTexCoord * texSize - 0.5;
    vec2 f = fract(p);
    vec2 base = floor(p) + 0.5;
    vec4 wx = weights(f.x);
    vec4 wy = weights(f.y);
    gl_FragColor = row(base, -1.0, wx) * wy.x
                 + row(base,  0.0, wx) * wy.y
                 + row(base,  1.0, wx) * wy.z
                 + row(base,  2.0, wx) * wy.w;
}
"#;

// Maps the 1.10 names onto 1.30 so one body serves both dialects.
const V130_VERTEX_PRELUDE: &str = "#define attribute in\n#define varying out\n";
const V130_FRAGMENT_PRELUDE: &str =
    "#define varying in\n#define texture2D texture\nout vec4 fragColor;\n#define gl_FragColor fragColor\n";

/// Assemble a full source for `version` from a dialect-neutral body.
pub fn with_prelude(version: GlslVersion, stage: ShaderStage, body: &str) -> String {
    let prelude = match (version, stage) {
        (GlslVersion::V110, _) => "",
        (GlslVersion::V130, ShaderStage::Vertex) => V130_VERTEX_PRELUDE,
        (GlslVersion::V130, ShaderStage::Fragment) => V130_FRAGMENT_PRELUDE,
    };
    format!("{}\n{}{}", version.directive(), prelude, body)
}

/// Sources for the programs every shader renderer needs.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinShaders;

impl BuiltinShaders {
    fn body(stage: ShaderStage, id: ShaderId) -> Option<&'static str> {
        let body = match (id, stage) {
            (ShaderId::Stencil, ShaderStage::Vertex) => STENCIL_VERTEX,
            (ShaderId::Stencil, ShaderStage::Fragment) => STENCIL_FRAGMENT,
            (ShaderId::Linear | ShaderId::Hermite | ShaderId::Cubic, ShaderStage::Vertex) => {
                TEXTURED_VERTEX
            }
            (ShaderId::Linear, ShaderStage::Fragment) => LINEAR_FRAGMENT,
            (ShaderId::Hermite, ShaderStage::Fragment) => HERMITE_FRAGMENT,
            (ShaderId::Cubic, ShaderStage::Fragment) => CUBIC_FRAGMENT,
            (ShaderId::Upscale(..), _) => return None,
        };
        Some(body)
    }

    /// Vertex shader shared by every textured-quad program, upscalers included.
    pub fn textured_vertex(version: GlslVersion) -> String {
        with_prelude(version, ShaderStage::Vertex, TEXTURED_VERTEX)
    }
}

impl ShaderSourceProvider for BuiltinShaders {
    fn source(&self, version: GlslVersion, stage: ShaderStage, id: ShaderId) -> Option<Cow<'_, str>> {
        Self::body(stage, id).map(|body| Cow::Owned(with_prelude(version, stage, body)))
    }
}

/// Built-in sources plus registered overrides and upscaler programs.
#[derive(Debug, Default, Clone)]
pub struct ShaderLibrary {
    sources: HashMap<(GlslVersion, ShaderStage, ShaderId), String>,
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register complete source text for one variant.
    pub fn insert(&mut self, version: GlslVersion, stage: ShaderStage, id: ShaderId, source: impl Into<String>) {
        self.sources.insert((version, stage, id), source.into());
    }

    /// Register an upscaler fragment body for every dialect. The vertex stage
    /// falls back to the built-in textured-quad shader.
    pub fn insert_upscaler(&mut self, kind: UpscaleKind, factor: u32, fragment_body: &str) {
        for version in GlslVersion::ALL {
            self.insert(
                version,
                ShaderStage::Fragment,
                ShaderId::Upscale(kind, factor),
                with_prelude(version, ShaderStage::Fragment, fragment_body),
            );
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl ShaderSourceProvider for ShaderLibrary {
    fn source(&self, version: GlslVersion, stage: ShaderStage, id: ShaderId) -> Option<Cow<'_, str>> {
        if let Some(source) = self.sources.get(&(version, stage, id)) {
            return Some(Cow::Borrowed(source.as_str()));
        }
        match (id, stage) {
            (ShaderId::Upscale(..), ShaderStage::Vertex)
                if self.sources.contains_key(&(version, ShaderStage::Fragment, id)) =>
            {
                Some(Cow::Owned(BuiltinShaders::textured_vertex(version)))
            }
            _ => BuiltinShaders.source(version, stage, id),
        }
    }
}

/// Pack a texture size into one integer uniform: width low, height high.
pub fn pack_tex_size(width: u32, height: u32) -> u32 {
    (width & 0xFFFF) | (height & 0xFFFF) << 16
}

/// A compiled program plus its uniform bindings.
#[derive(Debug)]
pub struct ShaderGroup {
    id: ShaderId,
    program: ProgramHandle,
    version: GlslVersion,
    mvp: Option<[f32; 16]>,
}

impl ShaderGroup {
    /// Compile `id`, trying each dialect of `ladder` in order.
    pub fn new(
        device: &mut dyn GraphicsDevice,
        provider: &dyn ShaderSourceProvider,
        ladder: &[GlslVersion],
        id: ShaderId,
        mvp: Option<[f32; 16]>,
    ) -> DisplayResult<Self> {
        let name = id.name();
        let mut last_error = None;

        for &version in ladder {
            let (Some(vertex), Some(fragment)) = (
                provider.source(version, ShaderStage::Vertex, id),
                provider.source(version, ShaderStage::Fragment, id),
            ) else {
                continue;
            };

            let source = ProgramSource {
                name: &name,
                vertex: &vertex,
                fragment: &fragment,
            };
            match device.compile_program(&source) {
                Ok(program) => {
                    debug!("Compiled program {} ({:?})", name, version);
                    return Ok(Self {
                        id,
                        program,
                        version,
                        mvp,
                    });
                }
                Err(err) => {
                    warn!("Program {} failed at {:?}: {}", name, version, err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(RenderError::ShaderSourceMissing(name)))
    }

    pub fn id(&self) -> ShaderId {
        self.id
    }

    pub fn version(&self) -> GlslVersion {
        self.version
    }

    /// Bind the program and set its uniforms.
    pub fn bind(&self, device: &mut dyn GraphicsDevice, tex_size: u32) {
        device.use_program(
            self.program,
            &Uniforms {
                tex_size: Some(tex_size),
                mvp: self.mvp.as_ref(),
            },
        );
    }

    pub fn destroy(self, device: &mut dyn GraphicsDevice) {
        device.delete_program(self.program);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceCaps, GlVersion, HeadlessDevice, HeadlessOptions};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ladder() {
        assert_eq!(
            GlslVersion::ladder(GlslVersion::V130, Some(GlslVersion::V130)),
            vec![GlslVersion::V130, GlslVersion::V110]
        );
        assert_eq!(
            GlslVersion::ladder(GlslVersion::V130, Some(GlslVersion::V110)),
            vec![GlslVersion::V110]
        );
        assert!(GlslVersion::ladder(GlslVersion::V110, None).is_empty());
    }

    #[test]
    fn test_builtin_sources_carry_directive() {
        let fragment = BuiltinShaders
            .source(GlslVersion::V130, ShaderStage::Fragment, ShaderId::Cubic)
            .unwrap();
        assert!(fragment.starts_with("#version 130"));
        assert!(fragment.contains("#define texture2D texture"));

        let vertex = BuiltinShaders
            .source(GlslVersion::V110, ShaderStage::Vertex, ShaderId::Stencil)
            .unwrap();
        assert!(vertex.starts_with("#version 110"));
        assert!(vertex.contains("uniform mat4 mvp"));

        assert!(BuiltinShaders
            .source(GlslVersion::V110, ShaderStage::Fragment, ShaderId::Upscale(UpscaleKind::Xbrz, 2))
            .is_none());
    }

    #[test]
    fn test_library_upscaler_fallbacks() {
        let mut library = ShaderLibrary::new();
        library.insert_upscaler(UpscaleKind::ScaleNx, 2, "void main() { gl_FragColor = vec4(0.0); }");
        let id = ShaderId::Upscale(UpscaleKind::ScaleNx, 2);

        assert!(library.source(GlslVersion::V130, ShaderStage::Vertex, id).is_some());
        assert!(library.source(GlslVersion::V110, ShaderStage::Fragment, id).is_some());
        assert!(library
            .source(GlslVersion::V110, ShaderStage::Vertex, ShaderId::Upscale(UpscaleKind::Eagle, 2))
            .is_none());
        assert!(library.source(GlslVersion::V110, ShaderStage::Fragment, ShaderId::Linear).is_some());
    }

    #[test]
    fn test_pack_tex_size() {
        assert_eq!(pack_tex_size(1024, 512), 1024 | 512 << 16);
    }

    #[test]
    fn test_group_falls_down_ladder() {
        let (mut device, probe) = HeadlessDevice::new(HeadlessOptions::default());
        let group = ShaderGroup::new(
            &mut device,
            &BuiltinShaders,
            &[GlslVersion::V130, GlslVersion::V110],
            ShaderId::Hermite,
            None,
        )
        .unwrap();
        assert_eq!(group.version(), GlslVersion::V130);
        group.bind(&mut device, pack_tex_size(4, 4));
        group.destroy(&mut device);
        assert!(probe.live_programs().is_empty());
    }

    #[test]
    fn test_group_reports_failure() {
        let (mut device, _) = HeadlessDevice::new(HeadlessOptions {
            caps: DeviceCaps {
                version: GlVersion::V3_0,
                ..Default::default()
            },
            failing_programs: vec!["cubic".into()],
            ..Default::default()
        });
        let err = ShaderGroup::new(
            &mut device,
            &BuiltinShaders,
            &[GlslVersion::V130, GlslVersion::V110],
            ShaderId::Cubic,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompile { .. }));

        let err = ShaderGroup::new(
            &mut device,
            &BuiltinShaders,
            &[GlslVersion::V110],
            ShaderId::Upscale(UpscaleKind::Xsal, 2),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::ShaderSourceMissing(_)));
    }
}

use clap::Parser;
use pixpipe_display::GlVersion;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pixpipe-bench")]
#[command(about = "Drive the presentation pipeline headlessly with a synthetic producer")]
#[command(version)]
pub struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long, env = "PIXPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 5)]
    pub duration: u64,

    /// Display mode as WIDTHxHEIGHT, overriding the configuration
    #[arg(short, long, value_name = "WxH", value_parser = parse_mode)]
    pub mode: Option<(u32, u32)>,

    /// Window size as WIDTHxHEIGHT
    #[arg(long, value_name = "WxH", value_parser = parse_mode, default_value = "1024x768")]
    pub window: (u32, u32),

    /// Rectangles the producer writes per tick
    #[arg(long, default_value_t = 16)]
    pub rects: u32,

    /// Producer tick interval in milliseconds
    #[arg(long, default_value_t = 16)]
    pub tick_ms: u64,

    /// Emulated OpenGL version of the headless device (e.g. 1.1, 2.0, 3.0)
    #[arg(long, value_name = "MAJOR.MINOR", value_parser = parse_gl_version)]
    pub gl_version: Option<GlVersion>,

    /// Emulated maximum texture edge of the headless device
    #[arg(long, default_value_t = 8192)]
    pub max_texture: u32,

    /// Directory to write a PNG snapshot into at the end of the run
    #[arg(long, value_name = "DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Copy the final snapshot to the clipboard
    #[arg(long)]
    pub clipboard: bool,

    /// Write a TOML run report to this path
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_mode(text: &str) -> Result<(u32, u32), String> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", text))?;
    let width = w.trim().parse().map_err(|e| format!("bad width '{}': {}", w, e))?;
    let height = h.trim().parse().map_err(|e| format!("bad height '{}': {}", h, e))?;
    Ok((width, height))
}

fn parse_gl_version(text: &str) -> Result<GlVersion, String> {
    let (major, minor) = text.split_once('.').unwrap_or((text, "0"));
    let major = major.parse().map_err(|e| format!("bad major version '{}': {}", major, e))?;
    let minor = minor.parse().map_err(|e| format!("bad minor version '{}': {}", minor, e))?;
    Ok(GlVersion::from_numbers(major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("800x600"), Ok((800, 600)));
        assert_eq!(parse_mode("1280X720"), Ok((1280, 720)));
        assert!(parse_mode("800").is_err());
        assert!(parse_mode("axb").is_err());
    }

    #[test]
    fn test_parse_gl_version() {
        assert_eq!(parse_gl_version("1.1"), Ok(GlVersion::V1_1));
        assert_eq!(parse_gl_version("1.4"), Ok(GlVersion::V1_2));
        assert_eq!(parse_gl_version("2"), Ok(GlVersion::V2_0));
        assert_eq!(parse_gl_version("4.6"), Ok(GlVersion::V3_0));
        assert!(parse_gl_version("x.y").is_err());
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["pixpipe-bench"]);
        assert_eq!(args.duration, 5);
        assert_eq!(args.window, (1024, 768));
        assert_eq!(args.mode, None);
        assert!(!args.clipboard);
    }
}

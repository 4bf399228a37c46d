// crates/server/src/separation/command.rs
//! Argument vector for the separation tool.
//!
//! Built only from validated options and sandboxed paths; nothing from the
//! request reaches the tool as free text.

use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;
use track2stem_core::{OutputFormat, SeparationOptions};

/// Bitrate for mp3 output, both from the tool and from the mixer.
pub const MP3_BITRATE_KBPS: u32 = 320;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// `<tool> -o <root> -n <model> --clip-mode .. --shifts .. --overlap ..
/// [--segment ..] [--mp3 --mp3-bitrate 320] <input>`
///
/// FLAC is rendered as WAV by the tool and transcoded afterwards.
pub fn separation_command(
    program: &str,
    options: &SeparationOptions,
    output_root: &Path,
    input: &Path,
) -> ToolCommand {
    let mut args = vec![
        "-o".to_string(),
        output_root.to_string_lossy().into_owned(),
        "-n".to_string(),
        options.model.as_str().to_string(),
        "--clip-mode".to_string(),
        options.clip_mode.as_str().to_string(),
        "--shifts".to_string(),
        options.shifts.get().to_string(),
        "--overlap".to_string(),
        options.overlap.to_string(),
    ];
    if let Some(segment) = options.segment {
        args.push("--segment".to_string());
        args.push(segment.get().to_string());
    }
    if options.output_format == OutputFormat::Mp3 {
        args.push("--mp3".to_string());
        args.push("--mp3-bitrate".to_string());
        args.push(MP3_BITRATE_KBPS.to_string());
    }
    args.push(input.to_string_lossy().into_owned());

    ToolCommand {
        program: program.to_string(),
        args,
        env: vec![
            // CPU only.
            ("CUDA_VISIBLE_DEVICES".to_string(), String::new()),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ],
        cwd: None,
    }
}

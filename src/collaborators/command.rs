//! Collaborators that shell out to external programs
//!
//! - [`CommandFixer`] runs a repair program as `<program> [args..] <disk>`
//!   with the guest facts as JSON in `VDISK_GUEST_FACTS`
//! - [`QemuImgConverter`] runs `qemu-img convert` into a temp name and renames
//! - [`CommandValidator`] runs a boot-test program as `<program> [args..] <image>`

use super::{
    BootProfile, BootValidator, CollaboratorError, ConvertOptions, ConvertResult, ExecContext,
    FixReport, FormatConverter, GuestFacts, GuestFixer, ValidationResult,
};
use crate::util::process;
use crate::DiskFormat;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Environment variable carrying guest facts to a fixer program
pub const GUEST_FACTS_ENV: &str = "VDISK_GUEST_FACTS";

fn format_filter(formats: &Option<Vec<DiskFormat>>, format: DiskFormat) -> bool {
    formats.as_ref().map_or(true, |list| list.contains(&format))
}

/// Guest repair through an external program
///
/// Exit status 0 is success. If stdout is a JSON [`FixReport`] it is used as-is;
/// otherwise lines starting with `warning:` become warnings and the image is
/// assumed changed.
#[derive(Debug, Clone)]
pub struct CommandFixer {
    program: PathBuf,
    args: Vec<String>,
    formats: Option<Vec<DiskFormat>>,
}

impl CommandFixer {
    /// Fixer for every format
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            formats: None,
        }
    }

    /// Extra arguments placed before the disk path
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Restrict to the given formats
    pub fn with_formats(mut self, formats: Vec<DiskFormat>) -> Self {
        self.formats = Some(formats);
        self
    }
}

fn parse_fix_output(stdout: &str) -> FixReport {
    if let Ok(report) = serde_json::from_str::<FixReport>(stdout.trim()) {
        return report;
    }
    let warnings = stdout
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            let lower = trimmed.to_ascii_lowercase();
            lower
                .starts_with("warning:")
                .then(|| trimmed["warning:".len()..].trim().to_string())
        })
        .collect();
    FixReport {
        changed: true,
        warnings,
    }
}

impl GuestFixer for CommandFixer {
    fn name(&self) -> &str {
        "command-fixer"
    }

    fn supports(&self, format: DiskFormat) -> bool {
        format_filter(&self.formats, format)
    }

    fn fix(&self, disk_path: &Path, facts: &GuestFacts, ctx: &ExecContext) -> Result<FixReport, CollaboratorError> {
        let facts_json = serde_json::to_string(facts)
            .map_err(|e| CollaboratorError::failed(self.name(), format!("cannot encode facts: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(disk_path)
            .env(GUEST_FACTS_ENV, facts_json)
            .current_dir(&ctx.work_dir);

        let output = process::run(command, ctx.deadline, &ctx.shutdown)?;
        if !output.success() {
            return Err(CollaboratorError::failed(self.name(), output.failure_summary()));
        }

        let report = parse_fix_output(&output.stdout);
        for warning in &report.warnings {
            warn!(disk_id = %ctx.disk_id, warning = %warning, "Guest repair warning");
        }
        Ok(report)
    }
}

/// Format conversion with `qemu-img convert`
#[derive(Debug, Clone)]
pub struct QemuImgConverter {
    program: PathBuf,
}

impl Default for QemuImgConverter {
    fn default() -> Self {
        Self::new("qemu-img")
    }
}

impl QemuImgConverter {
    /// Converter using the given `qemu-img` binary
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl FormatConverter for QemuImgConverter {
    fn name(&self) -> &str {
        "qemu-img"
    }

    fn supports(&self, format: DiskFormat) -> bool {
        format != DiskFormat::Unknown
    }

    fn convert(
        &self,
        src_path: &Path,
        dst_path: &Path,
        target_format: DiskFormat,
        options: &ConvertOptions,
        ctx: &ExecContext,
    ) -> Result<ConvertResult, CollaboratorError> {
        let temp_path = {
            let mut name = dst_path.as_os_str().to_owned();
            name.push(".converting");
            PathBuf::from(name)
        };
        if temp_path.exists() {
            std::fs::remove_file(&temp_path).map_err(|e| CollaboratorError::io(&temp_path, e))?;
        }

        let mut command = Command::new(&self.program);
        command
            .arg("convert")
            .arg("-f")
            .arg(options.source_format.qemu_name())
            .arg("-O")
            .arg(target_format.qemu_name());
        if options.compress && target_format == DiskFormat::Qcow2 {
            command.arg("-c");
        }
        command.arg(src_path).arg(&temp_path);

        let started = Instant::now();
        let result = process::run(command, ctx.deadline, &ctx.shutdown);
        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let _ = std::fs::remove_file(&temp_path);
                return Err(e.into());
            }
        };
        if !output.success() {
            let _ = std::fs::remove_file(&temp_path);
            return Err(CollaboratorError::failed(self.name(), output.failure_summary()));
        }

        std::fs::rename(&temp_path, dst_path).map_err(|e| CollaboratorError::io(dst_path, e))?;
        let size_bytes = std::fs::metadata(dst_path)
            .map_err(|e| CollaboratorError::io(dst_path, e))?
            .len();

        info!(
            src = %src_path.display(),
            dst = %dst_path.display(),
            from = %options.source_format,
            to = %target_format,
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Converted image"
        );
        Ok(ConvertResult {
            output_path: dst_path.to_path_buf(),
            size_bytes,
        })
    }
}

/// Boot validation through an external program
///
/// Exit status 0 means the guest booted; any other exit status means it did
/// not. The boot profile is passed as `VDISK_FIRMWARE` and `VDISK_MEMORY_MB`.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    program: PathBuf,
    args: Vec<String>,
    formats: Option<Vec<DiskFormat>>,
}

impl CommandValidator {
    /// Validator for every format
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            formats: None,
        }
    }

    /// Extra arguments placed before the image path
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Restrict to the given formats
    pub fn with_formats(mut self, formats: Vec<DiskFormat>) -> Self {
        self.formats = Some(formats);
        self
    }
}

impl BootValidator for CommandValidator {
    fn name(&self) -> &str {
        "command-validator"
    }

    fn supports(&self, format: DiskFormat) -> bool {
        format_filter(&self.formats, format)
    }

    fn validate(
        &self,
        image_path: &Path,
        profile: &BootProfile,
        ctx: &ExecContext,
    ) -> Result<ValidationResult, CollaboratorError> {
        let firmware = match profile.firmware {
            super::Firmware::Bios => "bios",
            super::Firmware::Uefi => "uefi",
        };
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(image_path)
            .env("VDISK_FIRMWARE", firmware)
            .env("VDISK_MEMORY_MB", profile.memory_mb.to_string())
            .current_dir(&ctx.work_dir);

        let boot_deadline = Instant::now() + profile.boot_timeout;
        let deadline = Some(ctx.deadline.map_or(boot_deadline, |d| d.min(boot_deadline)));

        let output = process::run(command, deadline, &ctx.shutdown)?;
        let detail = if output.success() {
            output
                .stdout
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("guest booted")
                .trim()
                .to_string()
        } else {
            output.failure_summary()
        };
        debug!(image = %image_path.display(), booted = output.success(), detail = %detail, "Boot validation finished");
        Ok(ValidationResult {
            booted: output.success(),
            detail,
        })
    }
}

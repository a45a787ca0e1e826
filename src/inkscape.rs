//! Typed Inkscape command lines.
//!
//! Every action that reaches `--actions` comes from a closed set, and object
//! ids are checked before they are joined into the action list, so nothing a
//! caller passes can smuggle extra actions into Inkscape.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::batch::command::{CommandTemplate, TemplateArg};
use crate::batch::BatchError;

pub const MAX_EXPORT_DPI: u32 = 9600;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InkscapeError {
    #[error("invalid object id '{0}'")]
    InvalidObjectId(String),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("unsupported export type '{0}'")]
    UnknownExportType(String),
    #[error("export dpi must be between 1 and {MAX_EXPORT_DPI}, got {0}")]
    InvalidDpi(u32),
    #[error("export size must be at least 1 pixel")]
    InvalidSize,
}

impl From<InkscapeError> for BatchError {
    fn from(value: InkscapeError) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportType {
    Png,
    Svg,
    Pdf,
    Ps,
    Eps,
    Emf,
    Wmf,
    Dxf,
}

impl ExportType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Svg => "svg",
            Self::Pdf => "pdf",
            Self::Ps => "ps",
            Self::Eps => "eps",
            Self::Emf => "emf",
            Self::Wmf => "wmf",
            Self::Dxf => "dxf",
        }
    }

    pub fn is_raster(self) -> bool {
        matches!(self, Self::Png)
    }
}

impl FromStr for ExportType {
    type Err = InkscapeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "svg" => Ok(Self::Svg),
            "pdf" => Ok(Self::Pdf),
            "ps" => Ok(Self::Ps),
            "eps" => Ok(Self::Eps),
            "emf" => Ok(Self::Emf),
            "wmf" => Ok(Self::Wmf),
            "dxf" => Ok(Self::Dxf),
            _ => Err(InkscapeError::UnknownExportType(raw.to_string())),
        }
    }
}

/// An SVG element id safe to embed in an action argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn parse(raw: &str) -> Result<Self, InkscapeError> {
        let mut chars = raw.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid_start || !valid_rest || raw.len() > 256 {
            return Err(InkscapeError::InvalidObjectId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InkscapeAction {
    SelectAll,
    SelectById(ObjectId),
    SelectionSimplify,
    SelectionReverse,
    SelectionUnion,
    SelectionDifference,
    SelectionIntersect,
    SelectionExclusion,
    SelectionDivision,
    ObjectToPath,
    PathCombine,
    PathBreakApart,
    FileVacuumDefs,
    FileCleanup,
}

impl fmt::Display for InkscapeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelectAll => f.write_str("select-all"),
            Self::SelectById(id) => write!(f, "select-by-id:{}", id.as_str()),
            Self::SelectionSimplify => f.write_str("selection-simplify"),
            Self::SelectionReverse => f.write_str("selection-reverse"),
            Self::SelectionUnion => f.write_str("selection-union"),
            Self::SelectionDifference => f.write_str("selection-diff"),
            Self::SelectionIntersect => f.write_str("selection-intersect"),
            Self::SelectionExclusion => f.write_str("selection-exclusion"),
            Self::SelectionDivision => f.write_str("selection-division"),
            Self::ObjectToPath => f.write_str("object-to-path"),
            Self::PathCombine => f.write_str("path-combine"),
            Self::PathBreakApart => f.write_str("path-break-apart"),
            Self::FileVacuumDefs => f.write_str("file-vacuum-defs"),
            Self::FileCleanup => f.write_str("file-cleanup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportArea {
    #[default]
    Page,
    Drawing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InkscapeCommand {
    export_type: ExportType,
    dpi: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    area: ExportArea,
    plain_svg: bool,
    actions: Vec<InkscapeAction>,
}

impl InkscapeCommand {
    pub fn export(export_type: ExportType) -> Self {
        Self {
            export_type,
            dpi: None,
            width: None,
            height: None,
            area: ExportArea::Page,
            plain_svg: false,
            actions: Vec::new(),
        }
    }

    /// Named presets used by the CLI `--action` flag.
    pub fn for_operation(
        name: &str,
        export_type: ExportType,
        object_ids: &[String],
    ) -> Result<Self, InkscapeError> {
        let selection = || -> Result<Vec<InkscapeAction>, InkscapeError> {
            if object_ids.is_empty() {
                return Ok(vec![InkscapeAction::SelectAll]);
            }
            object_ids
                .iter()
                .map(|id| ObjectId::parse(id.as_str()).map(InkscapeAction::SelectById))
                .collect()
        };
        let path_op = |action: InkscapeAction| -> Result<Self, InkscapeError> {
            let mut actions = selection()?;
            actions.push(action);
            Ok(Self::export(export_type).with_actions(actions))
        };

        match name.trim().to_ascii_lowercase().as_str() {
            "export" | "convert" => Ok(Self::export(export_type)),
            "optimize" => Ok(Self::export(ExportType::Svg)
                .plain_svg(true)
                .with_actions([InkscapeAction::FileVacuumDefs, InkscapeAction::FileCleanup])),
            "simplify" => path_op(InkscapeAction::SelectionSimplify),
            "reverse" => path_op(InkscapeAction::SelectionReverse),
            "union" => path_op(InkscapeAction::SelectionUnion),
            "difference" => path_op(InkscapeAction::SelectionDifference),
            "intersection" => path_op(InkscapeAction::SelectionIntersect),
            "exclusion" => path_op(InkscapeAction::SelectionExclusion),
            "division" => path_op(InkscapeAction::SelectionDivision),
            "object-to-path" => path_op(InkscapeAction::ObjectToPath),
            "combine" => path_op(InkscapeAction::PathCombine),
            "break-apart" => path_op(InkscapeAction::PathBreakApart),
            other => Err(InkscapeError::UnknownOperation(other.to_string())),
        }
    }

    pub fn export_type(&self) -> ExportType {
        self.export_type
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn with_size(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_area(mut self, area: ExportArea) -> Self {
        self.area = area;
        self
    }

    pub fn plain_svg(mut self, plain: bool) -> Self {
        self.plain_svg = plain;
        self
    }

    pub fn with_action(mut self, action: InkscapeAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = InkscapeAction>) -> Self {
        self.actions.extend(actions);
        self
    }

    pub fn actions(&self) -> &[InkscapeAction] {
        self.actions.as_slice()
    }

    /// Argument template with the input file first and the output as its own
    /// `--export-filename=` argument.
    pub fn template(&self) -> Result<CommandTemplate, InkscapeError> {
        if let Some(dpi) = self.dpi {
            if !(1..=MAX_EXPORT_DPI).contains(&dpi) {
                return Err(InkscapeError::InvalidDpi(dpi));
            }
        }
        if self.width == Some(0) || self.height == Some(0) {
            return Err(InkscapeError::InvalidSize);
        }

        let mut template = CommandTemplate::default()
            .push(TemplateArg::input())
            .push(TemplateArg::literal(format!(
                "--export-type={}",
                self.export_type.as_str()
            )))
            .push(TemplateArg::output_with_prefix("--export-filename="));
        if self.plain_svg && self.export_type == ExportType::Svg {
            template = template.push(TemplateArg::literal("--export-plain-svg"));
        }
        if self.export_type.is_raster() {
            if let Some(dpi) = self.dpi {
                template = template.push(TemplateArg::literal(format!("--export-dpi={dpi}")));
            }
            if let Some(width) = self.width {
                template = template.push(TemplateArg::literal(format!("--export-width={width}")));
            }
            if let Some(height) = self.height {
                template =
                    template.push(TemplateArg::literal(format!("--export-height={height}")));
            }
        }
        if self.area == ExportArea::Drawing {
            template = template.push(TemplateArg::literal("--export-area-drawing"));
        }
        if !self.actions.is_empty() {
            let mut chain = self
                .actions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>();
            chain.push(String::from("export-do"));
            template = template.push(TemplateArg::literal(format!("--actions={}", chain.join(";"))));
        }
        Ok(template)
    }
}

/// Accepts an absolute path to an existing executable file.
pub fn validate_executable(path: &Path) -> Result<PathBuf, BatchError> {
    if !path.is_absolute() {
        return Err(BatchError::ExecutableNotFound(path.to_path_buf()));
    }
    let meta = fs::metadata(path).map_err(|_| BatchError::ExecutableNotFound(path.to_path_buf()))?;
    if !meta.is_file() {
        return Err(BatchError::ExecutableNotFound(path.to_path_buf()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(BatchError::ExecutableNotFound(path.to_path_buf()));
        }
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(command: &InkscapeCommand) -> Vec<String> {
        command
            .template()
            .expect("template should build")
            .render(Path::new("/in/logo.svg"), Path::new("/out/.logo.partial-x.png"))
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn plain_export_keeps_output_as_own_argument() {
        let command = InkscapeCommand::export(ExportType::Png).with_dpi(192);
        assert_eq!(
            argv(&command),
            vec![
                "/in/logo.svg",
                "--export-type=png",
                "--export-filename=/out/.logo.partial-x.png",
                "--export-dpi=192",
            ]
        );
    }

    #[test]
    fn vector_exports_ignore_raster_options() {
        let command = InkscapeCommand::export(ExportType::Pdf)
            .with_dpi(300)
            .with_size(Some(64), None)
            .with_area(ExportArea::Drawing);
        assert_eq!(
            argv(&command),
            vec![
                "/in/logo.svg",
                "--export-type=pdf",
                "--export-filename=/out/.logo.partial-x.png",
                "--export-area-drawing",
            ]
        );
    }

    #[test]
    fn path_operations_build_action_chain() {
        let command = InkscapeCommand::for_operation(
            "simplify",
            ExportType::Svg,
            &[String::from("path12"), String::from("layer1.g-3")],
        )
        .expect("preset should build");
        let args = argv(&command);
        assert_eq!(
            args.last().map(String::as_str),
            Some("--actions=select-by-id:path12;select-by-id:layer1.g-3;selection-simplify;export-do")
        );

        let all = InkscapeCommand::for_operation("union", ExportType::Svg, &[]).unwrap();
        assert_eq!(
            all.actions(),
            &[InkscapeAction::SelectAll, InkscapeAction::SelectionUnion]
        );
    }

    #[test]
    fn optimize_preset_writes_plain_svg() {
        let command = InkscapeCommand::for_operation("optimize", ExportType::Png, &[]).unwrap();
        assert_eq!(command.export_type(), ExportType::Svg);
        let args = argv(&command);
        assert!(args.contains(&String::from("--export-plain-svg")));
        assert_eq!(
            args.last().map(String::as_str),
            Some("--actions=file-vacuum-defs;file-cleanup;export-do")
        );
    }

    #[test]
    fn hostile_object_ids_are_rejected() {
        for raw in ["a;file-close", "x y", "", "1abc", "id:other", "a\nb"] {
            assert_eq!(
                ObjectId::parse(raw),
                Err(InkscapeError::InvalidObjectId(raw.to_string())),
                "{raw:?} must be rejected"
            );
        }
        let err = InkscapeCommand::for_operation("simplify", ExportType::Svg, &[String::from("a;b")])
            .expect_err("injected id must fail");
        assert!(matches!(err, InkscapeError::InvalidObjectId(_)));
    }

    #[test]
    fn unknown_operation_and_bad_options_fail() {
        assert_eq!(
            InkscapeCommand::for_operation("script-fu", ExportType::Png, &[]),
            Err(InkscapeError::UnknownOperation(String::from("script-fu")))
        );
        assert_eq!(
            InkscapeCommand::export(ExportType::Png).with_dpi(0).template(),
            Err(InkscapeError::InvalidDpi(0))
        );
        assert_eq!("JPG".parse::<ExportType>(), Err(InkscapeError::UnknownExportType(String::from("JPG"))));
        assert_eq!(".PNG".parse::<ExportType>(), Ok(ExportType::Png));
    }

    #[test]
    fn validate_executable_requires_absolute_existing_file() {
        assert!(matches!(
            validate_executable(Path::new("inkscape")),
            Err(BatchError::ExecutableNotFound(_))
        ));
        assert!(matches!(
            validate_executable(Path::new("/definitely/missing/inkscape")),
            Err(BatchError::ExecutableNotFound(_))
        ));
        let dir = tempfile::tempdir().expect("scratch dir");
        assert!(validate_executable(dir.path()).is_err());

        #[cfg(unix)]
        assert_eq!(
            validate_executable(Path::new("/bin/sh")).expect("/bin/sh is executable"),
            PathBuf::from("/bin/sh")
        );
    }
}

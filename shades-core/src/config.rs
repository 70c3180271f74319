//! Formatter configuration recorded with every analysis.

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShadesError};

/// Flags owned by the invoker; passing them through would change how the
/// formatter reads input or reports results.
const RESERVED_FLAGS: &[&str] = &[
    "-c",
    "--code",
    "--check",
    "--diff",
    "-q",
    "--quiet",
    "-v",
    "--verbose",
    "--stdin-filename",
    "--fast",
    "--safe",
];

/// Formatting style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    /// Stable style.
    #[default]
    Stable,
    /// Preview style with unreleased changes.
    Preview,
}

/// Options passed to the formatter on every file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FormatterConfig {
    line_length: Option<u32>,
    style: Style,
    skip_string_normalization: bool,
    skip_magic_trailing_comma: bool,
    target_versions: Vec<String>,
    extra_args: Vec<String>,
}

impl FormatterConfig {
    /// Start building a configuration.
    pub fn builder() -> FormatterConfigBuilder {
        FormatterConfigBuilder::default()
    }

    /// Maximum line length override.
    pub fn line_length(&self) -> Option<u32> {
        self.line_length
    }

    /// Selected style.
    pub fn style(&self) -> Style {
        self.style
    }

    /// Whether string normalization is disabled.
    pub fn skip_string_normalization(&self) -> bool {
        self.skip_string_normalization
    }

    /// Whether magic trailing commas are ignored.
    pub fn skip_magic_trailing_comma(&self) -> bool {
        self.skip_magic_trailing_comma
    }

    /// Target language versions.
    pub fn target_versions(&self) -> &[String] {
        &self.target_versions
    }

    /// Passthrough arguments.
    pub fn extra_args(&self) -> &[String] {
        &self.extra_args
    }

    /// Whether no option differs from the formatter's defaults.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Check every option.
    pub fn validate(&self) -> Result<()> {
        if self.line_length == Some(0) {
            return Err(ShadesError::Config(
                "line length must be positive".to_string(),
            ));
        }
        for version in &self.target_versions {
            let digits = version.strip_prefix("py").unwrap_or_default();
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(ShadesError::Config(format!(
                    "unknown target version: {version:?}"
                )));
            }
        }
        for arg in &self.extra_args {
            if arg.trim().is_empty() {
                return Err(ShadesError::Config("empty formatter argument".to_string()));
            }
            let flag = arg.split('=').next().unwrap_or(arg);
            if RESERVED_FLAGS.contains(&flag) {
                return Err(ShadesError::Config(format!(
                    "{flag} is managed by shades and cannot be passed through"
                )));
            }
        }
        Ok(())
    }

    /// Render the configuration as formatter command-line arguments.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(length) = self.line_length {
            args.push("--line-length".to_string());
            args.push(length.to_string());
        }
        if self.style == Style::Preview {
            args.push("--preview".to_string());
        }
        if self.skip_string_normalization {
            args.push("--skip-string-normalization".to_string());
        }
        if self.skip_magic_trailing_comma {
            args.push("--skip-magic-trailing-comma".to_string());
        }
        for version in &self.target_versions {
            args.push("--target-version".to_string());
            args.push(version.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Builder for [`FormatterConfig`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone, Default)]
pub struct FormatterConfigBuilder {
    config: FormatterConfig,
}

impl FormatterConfigBuilder {
    /// Override the maximum line length.
    pub fn line_length(mut self, length: u32) -> Self {
        self.config.line_length = Some(length);
        self
    }

    /// Select a style.
    pub fn style(mut self, style: Style) -> Self {
        self.config.style = style;
        self
    }

    /// Disable string normalization.
    pub fn skip_string_normalization(mut self, skip: bool) -> Self {
        self.config.skip_string_normalization = skip;
        self
    }

    /// Ignore magic trailing commas.
    pub fn skip_magic_trailing_comma(mut self, skip: bool) -> Self {
        self.config.skip_magic_trailing_comma = skip;
        self
    }

    /// Add a target version such as `py311`.
    pub fn target_version(mut self, version: impl Into<String>) -> Self {
        self.config.target_versions.push(version.into());
        self
    }

    /// Append passthrough arguments.
    pub fn extra_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .extra_args
            .extend(args.into_iter().map(Into::into));
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<FormatterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::{FormatterConfig, Style};
    use crate::ShadesError;

    #[test]
    fn default_config_has_no_args() {
        let config = FormatterConfig::default();
        assert!(config.is_default());
        assert!(config.to_args().is_empty());
    }

    #[test]
    fn renders_recognised_options_before_passthrough() {
        let config = FormatterConfig::builder()
            .line_length(100)
            .style(Style::Preview)
            .skip_string_normalization(true)
            .target_version("py311")
            .extra_args(["--experimental-string-processing"])
            .build()
            .expect("valid config");

        assert_eq!(
            config.to_args(),
            vec![
                "--line-length",
                "100",
                "--preview",
                "--skip-string-normalization",
                "--target-version",
                "py311",
                "--experimental-string-processing",
            ]
        );
    }

    #[test]
    fn rejects_zero_line_length() {
        let error = FormatterConfig::builder()
            .line_length(0)
            .build()
            .expect_err("zero length");
        assert!(matches!(error, ShadesError::Config(_)));
    }

    #[test]
    fn rejects_reserved_flags_in_any_form() {
        for flag in ["--check", "--code=x = 1", "--fast", "-q"] {
            let result = FormatterConfig::builder().extra_args([flag]).build();
            assert!(result.is_err(), "{flag} should be rejected");
        }
    }

    #[test]
    fn rejects_blank_arguments_and_bad_versions() {
        assert!(FormatterConfig::builder().extra_args([" "]).build().is_err());
        assert!(
            FormatterConfig::builder()
                .target_version("python3")
                .build()
                .is_err()
        );
    }

    #[test]
    fn missing_fields_default_when_deserializing() {
        let config: FormatterConfig =
            serde_json::from_str(r#"{"lineLength": 88}"#).expect("parse config");
        assert_eq!(config.line_length(), Some(88));
        assert_eq!(config.style(), Style::Stable);
        assert!(config.extra_args().is_empty());
    }
}

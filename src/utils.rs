//! Common utilities.

use anyhow::Result;
use clap::ValueEnum as _;
use serde::Serialize;
use std::fmt;

/// Possible output formats of command results.
#[derive(Copy, Clone, Debug, Default, PartialEq, clap::ValueEnum)]
#[value(rename_all = "lower")]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
    PrettyJson,
    Toml,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.to_possible_value()
                .expect("no skipped values")
                .get_name()
        )
    }
}

/// Render `value` in the given format.
pub fn format_object<T: Serialize>(format: OutputFormat, value: &T) -> Result<String> {
    let text = match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string(value)?,
        OutputFormat::PrettyJson => serde_json::to_string_pretty(value)?,
        OutputFormat::Toml => toml::to_string(value)?,
    };
    Ok(text)
}

/// Prints an object in the specified format.
pub fn print_object<T: Serialize>(format: OutputFormat, value: &T) -> Result<()> {
    println!("{}", format_object(format, value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{format_object, OutputFormat};
    use anyhow::Result;
    use serde::Serialize;

    #[derive(Serialize)]
    #[serde(rename_all = "kebab-case")]
    struct Summary {
        image_type: &'static str,
        output: &'static str,
    }

    const SUMMARY: Summary = Summary {
        image_type: "live",
        output: "/tmp/liri.iso",
    };

    #[test]
    fn test_formats() -> Result<()> {
        assert_eq!(
            format_object(OutputFormat::Json, &SUMMARY)?,
            r#"{"image-type":"live","output":"/tmp/liri.iso"}"#
        );
        assert_eq!(
            format_object(OutputFormat::Yaml, &SUMMARY)?,
            "image-type: live\noutput: /tmp/liri.iso\n"
        );
        assert_eq!(
            format_object(OutputFormat::Toml, &SUMMARY)?,
            "image-type = \"live\"\noutput = \"/tmp/liri.iso\"\n"
        );
        Ok(())
    }

    #[test]
    fn test_display() {
        assert_eq!(OutputFormat::PrettyJson.to_string(), "prettyjson");
        assert_eq!(OutputFormat::default(), OutputFormat::Yaml);
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::recognition::{BoundingBox, RecognitionError, TextObservation, TextRecognizer};

const LEVEL_PAGE: u8 = 1;
const LEVEL_LINE: u8 = 4;
const LEVEL_WORD: u8 = 5;

/// Runs the `tesseract` command line engine as a subprocess.
///
/// The PNG is piped to stdin and the `tsv` report is read from stdout.
/// Words are merged into lines and boxes are normalised to the page with
/// the origin in the bottom-left corner.
#[derive(Debug, Clone)]
pub struct TesseractRecognizer {
    binary: PathBuf,
    language: Option<String>,
}

impl TesseractRecognizer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("stdin").arg("stdout");
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }
        command
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for TesseractRecognizer {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl TextRecognizer for TesseractRecognizer {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    async fn recognize(&self, image: &[u8]) -> Result<Vec<TextObservation>, RecognitionError> {
        let mut child = self.command().spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecognitionError::Engine("tesseract stdin unavailable".into()))?;

        // stdin is fed while stdout drains so a large image cannot fill both pipes
        let feed = async move {
            stdin.write_all(image).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RecognitionError::Engine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        if let Err(err) = fed {
            debug!(error = %err, "tesseract closed stdin early");
        }

        let report = String::from_utf8(output.stdout)
            .map_err(|err| RecognitionError::Engine(format!("tsv report is not UTF-8: {err}")))?;
        parse_tsv(&report)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LineKey {
    page: u32,
    block: u32,
    paragraph: u32,
    line: u32,
}

#[derive(Debug, Clone, Copy)]
struct PixelBox {
    left: f64,
    top: f64,
    width: f64,
    height: f64,
}

struct LineAccumulator {
    page: u32,
    bounds: Option<PixelBox>,
    words: Vec<String>,
}

struct Row<'a> {
    level: u8,
    key: LineKey,
    bounds: PixelBox,
    text: &'a str,
}

fn parse_row(line: &str) -> Result<Option<Row<'_>>, RecognitionError> {
    let columns: Vec<&str> = line.split('\t').collect();
    if columns.len() < 11 || columns[0] == "level" {
        return Ok(None);
    }

    let int = |index: usize| -> Result<u32, RecognitionError> {
        columns[index].trim().parse().map_err(|_| {
            RecognitionError::Engine(format!("unexpected tsv value {:?}", columns[index]))
        })
    };
    let level = int(0)?;
    let level = u8::try_from(level)
        .map_err(|_| RecognitionError::Engine(format!("unexpected tsv level {level}")))?;

    Ok(Some(Row {
        level,
        key: LineKey {
            page: int(1)?,
            block: int(2)?,
            paragraph: int(3)?,
            line: int(4)?,
        },
        bounds: PixelBox {
            left: f64::from(int(6)?),
            top: f64::from(int(7)?),
            width: f64::from(int(8)?),
            height: f64::from(int(9)?),
        },
        text: columns.get(11).copied().map_or("", str::trim),
    }))
}

/// Converts a `tesseract ... tsv` report into line observations.
pub fn parse_tsv(report: &str) -> Result<Vec<TextObservation>, RecognitionError> {
    let mut pages: HashMap<u32, PixelBox> = HashMap::new();
    let mut lines: Vec<LineAccumulator> = Vec::new();
    let mut index: HashMap<LineKey, usize> = HashMap::new();

    for raw in report.lines() {
        let Some(row) = parse_row(raw)? else {
            continue;
        };
        match row.level {
            LEVEL_PAGE => {
                pages.insert(row.key.page, row.bounds);
            }
            LEVEL_LINE | LEVEL_WORD => {
                let slot = *index.entry(row.key).or_insert_with(|| {
                    lines.push(LineAccumulator {
                        page: row.key.page,
                        bounds: None,
                        words: Vec::new(),
                    });
                    lines.len() - 1
                });
                let line = &mut lines[slot];
                if row.level == LEVEL_LINE {
                    line.bounds = Some(row.bounds);
                } else if !row.text.is_empty() {
                    line.words.push(row.text.to_owned());
                }
            }
            _ => {}
        }
    }

    let mut observations = Vec::new();
    for line in lines {
        if line.words.is_empty() {
            continue;
        }
        let page = pages
            .get(&line.page)
            .filter(|page| page.width > 0.0 && page.height > 0.0)
            .ok_or_else(|| {
                RecognitionError::Engine(format!("tsv report has no size for page {}", line.page))
            })?;
        let bounds = line.bounds.ok_or_else(|| {
            RecognitionError::Engine("tsv report has words without a line box".into())
        })?;

        observations.push(TextObservation {
            text: line.words.join(" "),
            bounding_box: BoundingBox {
                x: bounds.left / page.width,
                y: 1.0 - (bounds.top + bounds.height) / page.height,
                width: bounds.width / page.width,
                height: bounds.height / page.height,
            },
        });
    }

    Ok(observations)
}

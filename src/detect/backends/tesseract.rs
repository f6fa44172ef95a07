use std::io::{Cursor, Write};
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, Context, Result};
use image::{ImageFormat, RgbImage};

use crate::detect::backend::{OcrEngine, OcrSpan};

/// OCR through the `tesseract` command line tool.
///
/// The image is piped to stdin as PNG; word-level TSV on stdout is turned into
/// spans. Nothing touches the filesystem.
pub struct TesseractOcr {
    program: String,
    language: String,
    /// Page segmentation mode; 7 treats the image as one text line.
    psm: u8,
}

impl TesseractOcr {
    pub fn new(program: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            language: language.into(),
            psm: 7,
        }
    }

    pub fn with_page_segmentation(mut self, psm: u8) -> Self {
        self.psm = psm;
        self
    }

    fn args(&self) -> Vec<String> {
        vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            self.psm.to_string(),
            "-l".to_string(),
            self.language.clone(),
            "tsv".to_string(),
        ]
    }
}

impl OcrEngine for TesseractOcr {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn recognize(&mut self, image: &RgbImage) -> Result<Vec<OcrSpan>> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .context("encode OCR input as PNG")?;

        let mut child = Command::new(&self.program)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("launch {}", self.program))?;
        let fed = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&png).context("write OCR input"),
            None => Err(anyhow!("{} stdin unavailable", self.program)),
        };
        if let Err(err) = fed {
            reap(&mut child, &self.program);
            return Err(err);
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for {}", self.program))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Kill and wait so an abandoned OCR call leaves no zombie behind.
fn reap(child: &mut Child, program: &str) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.kill() {
        log::warn!("TesseractOcr: failed to kill {}: {}", program, err);
    }
    if let Err(err) = child.wait() {
        log::warn!("TesseractOcr: failed to reap {}: {}", program, err);
    }
}

/// Word rows (level 5) with a non-negative confidence and non-blank text.
fn parse_tsv(tsv: &str) -> Vec<OcrSpan> {
    let mut spans = Vec::new();
    for line in tsv.lines().skip(1) {
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() < 12 || columns[0] != "5" {
            continue;
        }
        let Ok(conf) = columns[10].trim().parse::<f32>() else {
            continue;
        };
        let text = columns[11].trim();
        if conf < 0.0 || text.is_empty() {
            continue;
        }
        spans.push(OcrSpan::new(text, (conf / 100.0).clamp(0.0, 1.0)));
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    const TSV: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext\n\
1\t1\t0\t0\t0\t0\t0\t0\t240\t100\t-1\t\n\
4\t1\t1\t1\t1\t0\t12\t30\t210\t40\t-1\t\n\
5\t1\t1\t1\t1\t1\t12\t30\t90\t40\t91.5\t29A\n\
5\t1\t1\t1\t1\t2\t110\t30\t112\t40\t87\t123.45\n\
5\t1\t1\t1\t1\t3\t230\t30\t5\t40\t-1\t \n";

    #[test]
    fn tsv_word_rows_become_spans() {
        let spans = parse_tsv(TSV);
        assert_eq!(
            spans,
            vec![OcrSpan::new("29A", 0.915), OcrSpan::new("123.45", 0.87)]
        );
    }

    #[test]
    fn single_line_mode_by_default() {
        let args = TesseractOcr::new("tesseract", "eng").args().join(" ");
        assert_eq!(args, "stdin stdout --psm 7 -l eng tsv");
    }

    #[test]
    fn missing_binary_is_an_error() {
        let mut ocr = TesseractOcr::new("/nonexistent/tesseract-plate-watch", "eng");
        assert!(ocr.recognize(&RgbImage::new(8, 8)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn engine_that_ignores_stdin_is_reported_and_reaped() {
        // Noise does not compress, so the PNG overflows the pipe buffer and
        // the write fails once `true` has exited.
        let noisy = RgbImage::from_fn(512, 512, |_, _| image::Rgb(rand::random::<[u8; 3]>()));
        let mut ocr = TesseractOcr::new("true", "eng");
        assert!(ocr.recognize(&noisy).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn reap_kills_and_waits() {
        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        reap(&mut child, "sleep");
        assert!(matches!(child.try_wait(), Ok(Some(_))));
    }
}

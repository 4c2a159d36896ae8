//! Output capture surface: the text buffer, the image slot and the
//! animation frames a snippet writes to, frozen once the run is over.

use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, Frame as GifFrame};

use super::error::{Interrupted, SnippetError};
use super::pixels::{PixelBuffer, PixelError, MAX_SURFACE_PIXELS};
use super::types::ErrorKind;

/// Upper bound on the total pixels held across all animation frames.
const MAX_FRAME_PIXELS: u64 = 4 * MAX_SURFACE_PIXELS;

/// Largest loop count encoded into a GIF.
const MAX_GIF_LOOPS: i64 = 100;

/// Renders one print-like call: values joined by `sep`, then `terminator`.
pub fn render_print(values: &[String], sep: &str, terminator: &str) -> String {
    let mut fragment = values.join(sep);
    fragment.push_str(terminator);
    fragment
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: PixelBuffer,
    pub delay_ms: u16,
}

/// Frames added with `output.add_frame`, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Animation {
    pub frames: Vec<Frame>,
    /// 0 loops forever, 1 plays once, n adds n-1 repeats.
    pub loops: i64,
}

impl Animation {
    pub fn repeat(&self) -> Repeat {
        match self.loops {
            1 => Repeat::Finite(0),
            n if n <= 0 => Repeat::Infinite,
            n => Repeat::Finite((n - 1).min(MAX_GIF_LOOPS) as u16),
        }
    }

    pub fn encode_gif(&self) -> Result<Vec<u8>, PixelError> {
        let mut frames = Vec::with_capacity(self.frames.len());
        for frame in &self.frames {
            let delay = Delay::from_numer_denom_ms(u32::from(frame.delay_ms), 1);
            frames.push(GifFrame::from_parts(frame.image.to_image()?, 0, 0, delay));
        }

        let mut bytes = Vec::new();
        {
            let mut encoder = GifEncoder::new(Cursor::new(&mut bytes));
            encoder.set_repeat(self.repeat())?;
            encoder.encode_frames(frames)?;
        }
        Ok(bytes)
    }
}

#[derive(Debug)]
pub enum CaptureError {
    /// The run is over; the capture has been handed to the controller.
    Frozen,
    TextLimit { limit: usize },
    FrameLimit,
}

impl From<CaptureError> for mlua::Error {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::Frozen => Interrupted.into(),
            CaptureError::TextLimit { limit } => SnippetError::new(
                ErrorKind::MemoryError,
                format!("output text exceeds the {limit} byte limit"),
            )
            .into(),
            CaptureError::FrameLimit => SnippetError::new(
                ErrorKind::MemoryError,
                "too many animation frames",
            )
            .into(),
        }
    }
}

/// Everything the controller receives once the run is over.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureSnapshot {
    pub text: String,
    pub image: Option<PixelBuffer>,
    pub animation: Option<Animation>,
}

#[derive(Debug)]
pub struct OutputCapture {
    text: String,
    image: Option<PixelBuffer>,
    frames: Vec<Frame>,
    frame_pixels: u64,
    loops: i64,
    frozen: bool,
    max_text_bytes: usize,
}

impl OutputCapture {
    pub fn new(max_text_bytes: usize) -> Self {
        Self {
            text: String::new(),
            image: None,
            frames: Vec::new(),
            frame_pixels: 0,
            loops: 0,
            frozen: false,
            max_text_bytes,
        }
    }

    fn writable(&self) -> Result<(), CaptureError> {
        if self.frozen {
            Err(CaptureError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn append_text(&mut self, fragment: &str) -> Result<(), CaptureError> {
        self.writable()?;
        if self.text.len() + fragment.len() > self.max_text_bytes {
            return Err(CaptureError::TextLimit {
                limit: self.max_text_bytes,
            });
        }
        self.text.push_str(fragment);
        Ok(())
    }

    pub fn replace_text(&mut self, text: String) -> Result<(), CaptureError> {
        self.writable()?;
        if text.len() > self.max_text_bytes {
            return Err(CaptureError::TextLimit {
                limit: self.max_text_bytes,
            });
        }
        self.text = text;
        Ok(())
    }

    /// Later assignments overwrite earlier ones; `None` clears the slot.
    pub fn set_image(&mut self, image: Option<PixelBuffer>) -> Result<(), CaptureError> {
        self.writable()?;
        self.image = image;
        Ok(())
    }

    pub fn add_frame(&mut self, image: PixelBuffer, delay_ms: u16) -> Result<(), CaptureError> {
        self.writable()?;
        let pixels = u64::from(image.width()) * u64::from(image.height());
        if self.frame_pixels + pixels > MAX_FRAME_PIXELS {
            return Err(CaptureError::FrameLimit);
        }
        self.frame_pixels += pixels;
        self.frames.push(Frame { image, delay_ms });
        Ok(())
    }

    pub fn set_loops(&mut self, loops: i64) -> Result<(), CaptureError> {
        self.writable()?;
        self.loops = loops;
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn image(&self) -> Option<&PixelBuffer> {
        self.image.as_ref()
    }

    pub fn loops(&self) -> i64 {
        self.loops
    }

    /// Seals the capture and hands its contents out. Returns `None` if
    /// it was already frozen, so the hand-off happens exactly once.
    pub fn freeze(&mut self) -> Option<CaptureSnapshot> {
        if self.frozen {
            return None;
        }
        self.frozen = true;
        let frames = std::mem::take(&mut self.frames);
        let animation = (!frames.is_empty()).then(|| Animation {
            frames,
            loops: self.loops,
        });
        Some(CaptureSnapshot {
            text: std::mem::take(&mut self.text),
            image: self.image.take(),
            animation,
        })
    }
}

/// Handle to one request's capture, shared by the host builtins running
/// on the execution thread and the controller.
#[derive(Debug, Clone)]
pub struct SharedCapture(Arc<Mutex<OutputCapture>>);

impl SharedCapture {
    pub fn new(max_text_bytes: usize) -> Self {
        Self(Arc::new(Mutex::new(OutputCapture::new(max_text_bytes))))
    }

    pub fn lock(&self) -> MutexGuard<'_, OutputCapture> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append_text(&self, fragment: &str) -> Result<(), CaptureError> {
        self.lock().append_text(fragment)
    }

    pub fn freeze(&self) -> Option<CaptureSnapshot> {
        self.lock().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::pixels::Rgba;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_render_print_defaults() {
        assert_eq!(render_print(&strings(&["a", "1", "true"]), " ", "\n"), "a 1 true\n");
        assert_eq!(render_print(&[], " ", "\n"), "\n");
    }

    #[test]
    fn test_render_print_custom_separator_and_terminator() {
        assert_eq!(render_print(&strings(&["x", "y"]), ", ", "!"), "x, y!");
        assert_eq!(render_print(&strings(&["x"]), "", ""), "x");
    }

    #[test]
    fn test_appends_are_ordered() {
        let mut capture = OutputCapture::new(1024);
        capture.append_text("one\n").unwrap();
        capture.append_text("two\n").unwrap();
        assert_eq!(capture.text(), "one\ntwo\n");
    }

    #[test]
    fn test_text_limit_keeps_previous_text() {
        let mut capture = OutputCapture::new(8);
        capture.append_text("12345").unwrap();
        let err = capture.append_text("6789").unwrap_err();
        assert!(matches!(err, CaptureError::TextLimit { limit: 8 }));
        assert_eq!(capture.text(), "12345");
    }

    #[test]
    fn test_freeze_hands_off_once_and_blocks_writes() {
        let mut capture = OutputCapture::new(1024);
        capture.append_text("partial").unwrap();
        let snapshot = capture.freeze().unwrap();
        assert_eq!(snapshot.text, "partial");
        assert!(capture.freeze().is_none());
        assert!(matches!(capture.append_text("late"), Err(CaptureError::Frozen)));
        assert!(matches!(capture.set_image(None), Err(CaptureError::Frozen)));
    }

    #[test]
    fn test_second_image_overwrites_first() {
        let mut capture = OutputCapture::new(1024);
        let first = PixelBuffer::new(1, 1, Rgba::BLACK).unwrap();
        let second = PixelBuffer::new(2, 2, Rgba::BLACK).unwrap();
        capture.set_image(Some(first)).unwrap();
        capture.set_image(Some(second.clone())).unwrap();
        assert_eq!(capture.freeze().unwrap().image, Some(second));
    }

    #[test]
    fn test_frames_become_animation() {
        let mut capture = OutputCapture::new(1024);
        let frame = PixelBuffer::new(2, 2, Rgba::BLACK).unwrap();
        capture.add_frame(frame.clone(), 100).unwrap();
        capture.add_frame(frame, 250).unwrap();
        capture.set_loops(3).unwrap();
        let animation = capture.freeze().unwrap().animation.unwrap();
        assert_eq!(animation.frames.len(), 2);
        assert_eq!(animation.frames[1].delay_ms, 250);
        assert!(matches!(animation.repeat(), Repeat::Finite(2)));
    }

    #[test]
    fn test_repeat_mapping() {
        let animation = |loops| Animation {
            frames: vec![],
            loops,
        };
        assert!(matches!(animation(0).repeat(), Repeat::Infinite));
        assert!(matches!(animation(-4).repeat(), Repeat::Infinite));
        assert!(matches!(animation(1).repeat(), Repeat::Finite(0)));
        assert!(matches!(animation(500).repeat(), Repeat::Finite(100)));
    }

    #[test]
    fn test_encode_gif_header() {
        let frame = PixelBuffer::new(2, 2, Rgba::new(0, 255, 0, 255)).unwrap();
        let animation = Animation {
            frames: vec![Frame {
                image: frame,
                delay_ms: 100,
            }],
            loops: 0,
        };
        let gif = animation.encode_gif().unwrap();
        assert_eq!(&gif[..6], b"GIF89a");
    }
}

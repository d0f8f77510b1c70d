use anyhow::{bail, Context, Result};
use clap::Parser;
use opencv::{
    core::{self, Mat, Point, Ptr, Rect, Scalar, Size, Vector},
    highgui, imgproc,
    prelude::*,
    video::{self, BackgroundSubtractorMOG2},
    videoio,
};
use serde::Serialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::Instant,
};

#[derive(Parser, Debug)]
#[command(name = "motioncam", about = "Live webcam motion detection with bounding boxes and speed overlay")]
struct Args {
    /// Camera device index
    #[arg(long, default_value_t = 0)]
    camera: i32,
    /// Binary threshold applied to the foreground mask (lower = more sensitive)
    #[arg(long, default_value_t = 25)]
    sensitivity: i32,
    /// Minimum contour area counted as a motion detection
    #[arg(long, default_value_t = 500)]
    min_area: i32,
    /// Background model history length in frames
    #[arg(long, default_value_t = 500)]
    bg_history: i32,
    /// Background model variance threshold
    #[arg(long, default_value_t = 16.0)]
    var_threshold: f64,
    /// Disable shadow detection in the background model
    #[arg(long)]
    no_shadows: bool,
    /// Write newline-delimited JSON events (session, parameter changes, per-second summaries)
    #[arg(long)]
    log_json: Option<PathBuf>,
}

const SENSITIVITY_MIN: i32 = 5;
const SENSITIVITY_MAX: i32 = 100;
const SENSITIVITY_STEP: i32 = 5;
const MIN_AREA_MIN: i32 = 100;
const MIN_AREA_MAX: i32 = 5000;
const MIN_AREA_STEP: i32 = 100;
const MAX_HISTORY: usize = 10;
const SPEED_WINDOW_SECS: f64 = 1.0;
const MASK_THUMB_WIDTH: i32 = 200;
const MASK_THUMB_HEIGHT: i32 = 150;
const MASK_THUMB_MARGIN: i32 = 10;

/// BGR palette indexed by speed bucket; faster motion shifts toward warm colors.
const PALETTE: [(f64, f64, f64); 6] = [
    (0.0, 255.0, 0.0),   // green
    (255.0, 0.0, 0.0),   // blue
    (0.0, 0.0, 255.0),   // red
    (255.0, 255.0, 0.0), // cyan
    (255.0, 0.0, 255.0), // magenta
    (0.0, 255.0, 255.0), // yellow
];

fn speed_bucket(speed: f64) -> usize {
    ((speed / 10.0) as usize).min(PALETTE.len() - 1)
}

fn speed_color(speed: f64) -> Scalar {
    let (b, g, r) = PALETTE[speed_bucket(speed)];
    Scalar::new(b, g, r, 0.0)
}

/// Runtime-adjustable detection parameters, clamped to fixed ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Tunables {
    sensitivity: i32,
    min_area: i32,
}

impl Tunables {
    fn new(sensitivity: i32, min_area: i32) -> Self {
        Self {
            sensitivity: sensitivity.clamp(SENSITIVITY_MIN, SENSITIVITY_MAX),
            min_area: min_area.clamp(MIN_AREA_MIN, MIN_AREA_MAX),
        }
    }

    /// More sensitive means a lower mask threshold.
    fn raise_sensitivity(&mut self) {
        self.sensitivity = (self.sensitivity - SENSITIVITY_STEP).max(SENSITIVITY_MIN);
    }

    fn lower_sensitivity(&mut self) {
        self.sensitivity = (self.sensitivity + SENSITIVITY_STEP).min(SENSITIVITY_MAX);
    }

    fn grow_min_area(&mut self) {
        self.min_area = (self.min_area + MIN_AREA_STEP).min(MIN_AREA_MAX);
    }

    fn shrink_min_area(&mut self) {
        self.min_area = (self.min_area - MIN_AREA_STEP).max(MIN_AREA_MIN);
    }
}

#[derive(Clone, Copy, Debug)]
struct HistoryEntry {
    center: Point,
    at: Instant,
}

/// Bounded FIFO of recent detection centroids, shared across all objects and
/// frames. The speed estimate takes the first entry younger than one second,
/// not the nearest one, so the readout is an approximation rather than a
/// per-object tracker.
struct DetectionHistory {
    entries: Vec<HistoryEntry>,
}

impl DetectionHistory {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    fn push(&mut self, center: Point, at: Instant) {
        self.entries.push(HistoryEntry { center, at });
        if self.entries.len() > MAX_HISTORY {
            self.entries.remove(0);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    /// Pixels per second against the first sufficiently recent entry, 0 when
    /// nothing recent is on record.
    fn speed_for(&self, center: Point, now: Instant) -> f64 {
        for entry in &self.entries {
            let age = now.saturating_duration_since(entry.at).as_secs_f64();
            if age > 0.0 && age < SPEED_WINDOW_SECS {
                let dx = f64::from(center.x - entry.center.x);
                let dy = f64::from(center.y - entry.center.y);
                return (dx * dx + dy * dy).sqrt() / age;
            }
        }
        0.0
    }
}

/// One qualifying foreground contour in the current frame.
#[derive(Clone, Copy, Debug)]
struct Detection {
    rect: Rect,
    center: Point,
    area: f64,
    speed: f64,
}

/// Minimal capability surface over the statistical background model so the
/// frame loop does not care which subtractor sits behind it.
trait BackgroundModel {
    fn apply(&mut self, frame: &Mat, fgmask: &mut Mat) -> Result<()>;
    /// Discard all learned background state.
    fn reset(&mut self) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
struct Mog2Settings {
    history: i32,
    var_threshold: f64,
    detect_shadows: bool,
}

struct Mog2Model {
    subtractor: Ptr<BackgroundSubtractorMOG2>,
    settings: Mog2Settings,
}

fn mog2_from_settings(settings: Mog2Settings) -> Result<Ptr<BackgroundSubtractorMOG2>> {
    video::create_background_subtractor_mog2(
        settings.history,
        settings.var_threshold,
        settings.detect_shadows,
    )
    .context("Failed to create MOG2 background subtractor")
}

impl Mog2Model {
    fn new(settings: Mog2Settings) -> Result<Self> {
        Ok(Self {
            subtractor: mog2_from_settings(settings)?,
            settings,
        })
    }
}

impl BackgroundModel for Mog2Model {
    fn apply(&mut self, frame: &Mat, fgmask: &mut Mat) -> Result<()> {
        // Learning rate -1 lets the subtractor derive its own rate from history.
        BackgroundSubtractorTrait::apply(&mut self.subtractor, frame, fgmask, -1.0)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.subtractor = mog2_from_settings(self.settings)?;
        Ok(())
    }
}

/// FPS over at-least-one-second windows; `current()` holds the last closed
/// window's measurement between closes.
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    current: f64,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            current: 0.0,
        }
    }

    fn tick(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start).as_secs_f64();
        if elapsed >= 1.0 {
            self.current = f64::from(self.frames) / elapsed;
            self.frames = 0;
            self.window_start = now;
            Some(self.current)
        } else {
            None
        }
    }

    fn current(&self) -> f64 {
        self.current
    }
}

#[derive(Serialize)]
struct SessionLog {
    event: &'static str,
    timestamp: String,
    camera: i32,
    frame_width: i32,
    frame_height: i32,
    sensitivity: i32,
    min_area: i32,
    bg_history: i32,
    var_threshold: f64,
    detect_shadows: bool,
}

#[derive(Serialize)]
struct ParamLog {
    event: &'static str,
    timestamp: String,
    name: &'static str,
    value: i32,
}

#[derive(Serialize)]
struct SummaryLog {
    event: &'static str,
    timestamp: String,
    fps: f64,
    objects: usize,
    sensitivity: i32,
    min_area: i32,
}

#[derive(Serialize)]
struct SessionEndLog {
    event: &'static str,
    timestamp: String,
    frames: u64,
}

struct JsonLogger {
    writer: BufWriter<File>,
}

impl JsonLogger {
    fn new(path: &Path) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_event<T: Serialize>(&mut self, event: &T) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

fn timestamp_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    let mut capture = videoio::VideoCapture::new(args.camera, videoio::CAP_ANY)
        .with_context(|| format!("Failed to open camera {}", args.camera))?;
    if !capture.is_opened()? {
        bail!("Failed to open camera {}", args.camera);
    }

    let frame_width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
    let frame_height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
    tracing::info!("camera {} open at {}x{}", args.camera, frame_width, frame_height);

    let mut tunables = Tunables::new(args.sensitivity, args.min_area);
    let settings = Mog2Settings {
        history: args.bg_history,
        var_threshold: args.var_threshold,
        detect_shadows: !args.no_shadows,
    };
    let mut model = Mog2Model::new(settings)?;
    let mut history = DetectionHistory::new();
    let kernel =
        imgproc::get_structuring_element(imgproc::MORPH_RECT, Size::new(5, 5), Point::new(-1, -1))?;

    let mut json_logger = match args.log_json.as_ref() {
        Some(path) => Some(JsonLogger::new(path)?),
        None => None,
    };
    if let Some(logger) = json_logger.as_mut() {
        logger.write_event(&SessionLog {
            event: "session_start",
            timestamp: timestamp_now(),
            camera: args.camera,
            frame_width,
            frame_height,
            sensitivity: tunables.sensitivity,
            min_area: tunables.min_area,
            bg_history: settings.history,
            var_threshold: settings.var_threshold,
            detect_shadows: settings.detect_shadows,
        })?;
        logger.flush()?;
    }

    let window_name = "motioncam";
    highgui::named_window(window_name, highgui::WINDOW_NORMAL)?;
    highgui::resize_window(window_name, frame_width, frame_height)?;

    tracing::info!(
        "motion detection running: q quit, r reset background, +/- sensitivity, a/z min area"
    );

    let mut fps = FpsCounter::new(Instant::now());
    let mut total_frames: u64 = 0;
    let mut frame = Mat::default();
    let mut mirrored = Mat::default();
    let mut raw_mask = Mat::default();

    loop {
        if !capture.read(&mut frame)? || frame.empty() {
            tracing::warn!("camera stream ended");
            break;
        }
        total_frames += 1;
        let now = Instant::now();

        // Mirror flip so the display behaves like looking into a mirror.
        core::flip(&frame, &mut mirrored, 1)?;

        model.apply(&mirrored, &mut raw_mask)?;
        let mask = clean_mask(&raw_mask, tunables.sensitivity, &kernel)?;
        let detections = extract_detections(&mask, tunables.min_area, &mut history, now)?;

        draw_detections(&mut mirrored, &detections)?;
        if let Some(measured) = fps.tick(now) {
            if let Some(logger) = json_logger.as_mut() {
                logger.write_event(&SummaryLog {
                    event: "summary",
                    timestamp: timestamp_now(),
                    fps: measured,
                    objects: detections.len(),
                    sensitivity: tunables.sensitivity,
                    min_area: tunables.min_area,
                })?;
                logger.flush()?;
            }
        }
        draw_hud(&mut mirrored, fps.current(), detections.len(), tunables)?;
        draw_mask_thumbnail(&mut mirrored, &mask)?;

        highgui::imshow(window_name, &mirrored)?;
        let key = highgui::wait_key(1)?;
        if let LoopControl::Quit =
            handle_key(key, &mut tunables, &mut model, &mut history, &mut json_logger)?
        {
            break;
        }
    }

    capture.release()?;
    highgui::destroy_all_windows()?;

    if let Some(logger) = json_logger.as_mut() {
        logger.write_event(&SessionEndLog {
            event: "session_end",
            timestamp: timestamp_now(),
            frames: total_frames,
        })?;
        logger.flush()?;
    }
    tracing::info!("exited after {} frames", total_frames);
    Ok(())
}

/// Threshold, open, then double dilation over the raw foreground mask.
/// Opening drops speckle noise; the dilations merge nearby fragments so one
/// moving object tends to produce one contour.
fn clean_mask(raw: &Mat, sensitivity: i32, kernel: &Mat) -> Result<Mat> {
    let mut thresholded = Mat::default();
    imgproc::threshold(
        raw,
        &mut thresholded,
        f64::from(sensitivity),
        255.0,
        imgproc::THRESH_BINARY,
    )?;

    let mut opened = Mat::default();
    imgproc::morphology_ex(
        &thresholded,
        &mut opened,
        imgproc::MORPH_OPEN,
        kernel,
        Point::new(-1, -1),
        1,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;

    let mut dilated = Mat::default();
    imgproc::dilate(
        &opened,
        &mut dilated,
        kernel,
        Point::new(-1, -1),
        2,
        core::BORDER_CONSTANT,
        imgproc::morphology_default_border_value()?,
    )?;
    Ok(dilated)
}

/// External contours over `min_area` become detections, in whatever order the
/// contour extraction yields them. Each detection's centroid is appended to
/// the shared history after its own speed has been estimated.
fn extract_detections(
    mask: &Mat,
    min_area: i32,
    history: &mut DetectionHistory,
    now: Instant,
) -> Result<Vec<Detection>> {
    let mut contours: Vector<Vector<Point>> = Vector::new();
    imgproc::find_contours(
        mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
        Point::new(0, 0),
    )?;

    let mut detections = Vec::new();
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        if area <= f64::from(min_area) {
            continue;
        }
        let rect = imgproc::bounding_rect(&contour)?;
        let center = Point::new(rect.x + rect.width / 2, rect.y + rect.height / 2);
        let speed = history.speed_for(center, now);
        history.push(center, now);
        detections.push(Detection {
            rect,
            center,
            area,
            speed,
        });
    }
    Ok(detections)
}

fn draw_detections(frame: &mut Mat, detections: &[Detection]) -> Result<()> {
    for detection in detections {
        let color = speed_color(detection.speed);
        imgproc::rectangle(frame, detection.rect, color, 2, imgproc::LINE_8, 0)?;
        imgproc::circle(frame, detection.center, 5, color, -1, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            frame,
            &format!("Area: {}", detection.area as i64),
            Point::new(detection.rect.x, detection.rect.y - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            color,
            1,
            imgproc::LINE_8,
            false,
        )?;
        if detection.speed > 0.0 {
            imgproc::put_text(
                frame,
                &format!("Speed: {:.1} px/s", detection.speed),
                Point::new(detection.rect.x, detection.rect.y - 30),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_8,
                false,
            )?;
        }
    }
    Ok(())
}

fn draw_hud(frame: &mut Mat, fps: f64, objects: usize, tunables: Tunables) -> Result<()> {
    let white = Scalar::new(255.0, 255.0, 255.0, 0.0);
    let gray = Scalar::new(200.0, 200.0, 200.0, 0.0);
    let bottom = frame.rows() - 10;

    imgproc::put_text(
        frame,
        &format!("FPS: {fps:.1}"),
        Point::new(10, 30),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        white,
        2,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        frame,
        &format!("Objects: {objects}"),
        Point::new(10, 60),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.7,
        white,
        2,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        frame,
        &format!("Sensitivity: {}", tunables.sensitivity),
        Point::new(10, 90),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        gray,
        1,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        frame,
        &format!("Min Area: {}", tunables.min_area),
        Point::new(10, 110),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        gray,
        1,
        imgproc::LINE_8,
        false,
    )?;
    imgproc::put_text(
        frame,
        "q quit | r reset | +/- sensitivity | a/z min area",
        Point::new(10, bottom),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        gray,
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Composite a 200x150 preview of the binary mask into the top-right corner.
/// Frames too small to hold the thumbnail go without one.
fn draw_mask_thumbnail(frame: &mut Mat, mask: &Mat) -> Result<()> {
    let frame_width = frame.cols();
    let frame_height = frame.rows();
    let slot = Rect::new(
        frame_width - MASK_THUMB_WIDTH - MASK_THUMB_MARGIN,
        MASK_THUMB_MARGIN,
        MASK_THUMB_WIDTH,
        MASK_THUMB_HEIGHT,
    );
    if slot.x <= 0 || slot.y + slot.height >= frame_height {
        return Ok(());
    }

    let mut small = Mat::default();
    imgproc::resize(
        mask,
        &mut small,
        Size::new(MASK_THUMB_WIDTH, MASK_THUMB_HEIGHT),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    let mut small_bgr = Mat::default();
    imgproc::cvt_color(
        &small,
        &mut small_bgr,
        imgproc::COLOR_GRAY2BGR,
        0,
    )?;
    {
        let mut slot_view = Mat::roi_mut(frame, slot)?;
        small_bgr.copy_to(&mut slot_view)?;
    }
    imgproc::put_text(
        frame,
        "Motion Mask",
        Point::new(frame_width - MASK_THUMB_WIDTH, 20),
        imgproc::FONT_HERSHEY_SIMPLEX,
        0.5,
        Scalar::new(255.0, 255.0, 255.0, 0.0),
        1,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

enum LoopControl {
    Continue,
    Quit,
}

/// Single-character poll result from the display loop. Unknown keys and the
/// "no key" sentinel fall through with no effect.
fn handle_key(
    key: i32,
    tunables: &mut Tunables,
    model: &mut dyn BackgroundModel,
    history: &mut DetectionHistory,
    logger: &mut Option<JsonLogger>,
) -> Result<LoopControl> {
    let Some(key) = u8::try_from(key).ok().map(char::from) else {
        return Ok(LoopControl::Continue);
    };
    match key {
        'q' => return Ok(LoopControl::Quit),
        'r' => {
            model.reset()?;
            history.clear();
            tracing::info!("background model reset, history cleared");
        }
        '+' | '=' => {
            tunables.raise_sensitivity();
            log_param(logger, "sensitivity", tunables.sensitivity)?;
        }
        '-' | '_' => {
            tunables.lower_sensitivity();
            log_param(logger, "sensitivity", tunables.sensitivity)?;
        }
        'a' => {
            tunables.grow_min_area();
            log_param(logger, "min_area", tunables.min_area)?;
        }
        'z' => {
            tunables.shrink_min_area();
            log_param(logger, "min_area", tunables.min_area)?;
        }
        _ => {}
    }
    Ok(LoopControl::Continue)
}

fn log_param(logger: &mut Option<JsonLogger>, name: &'static str, value: i32) -> Result<()> {
    tracing::info!("{} set to {}", name, value);
    if let Some(logger) = logger.as_mut() {
        logger.write_event(&ParamLog {
            event: "param_change",
            timestamp: timestamp_now(),
            name,
            value,
        })?;
    }
    Ok(())
}

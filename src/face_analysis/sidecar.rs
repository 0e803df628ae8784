//! Face detector and landmark predictor backed by an external model process.
//!
//! The sidecar is spawned once per analyzer and kept alive across images. It
//! reads one JSON request per line on stdin and answers with one JSON line on
//! stdout, echoing the request `id`:
//!
//! ```text
//! {"id":1,"op":"detect","image":"/tmp/x.png","upsample":1}
//!     -> {"id":1,"regions":[{"left":10,"top":12,"right":89,"bottom":95}]}
//! {"id":2,"op":"landmarks","image":"/tmp/x.png",
//!     "region":{"left":10,"top":12,"right":89,"bottom":95}}
//!     -> {"id":2,"landmarks":[[x,y], ... 68 pairs]}  or  {"id":2,"landmarks":null}
//! ```
//!
//! Bounds are inclusive, as dlib reports them. Any reply may instead carry
//! `{"id":n,"error":"..."}`. Output lines that are not JSON are skipped and
//! replies to earlier requests are discarded. A closed pipe or an id from the
//! future kills the process, and the handle reports itself unusable.

use anyhow::{anyhow, Result};
use image::GrayImage;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::detection::{CancelHandle, FaceDetector, LandmarkPredictor, Region};
use super::landmarks::LandmarkSet;
use crate::error::AnalysisError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Program and arguments used to launch a sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl SidecarCommand {
    /// Split a whitespace-separated command line such as `python3 sidecar.py --model m.dat`
    pub fn parse(command_line: &str) -> Result<Self, AnalysisError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| AnalysisError::InvalidConfig("empty sidecar command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

/// dlib rectangle; `right` and `bottom` are the last covered pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Bounds {
    left: i64,
    top: i64,
    right: i64,
    bottom: i64,
}

impl Bounds {
    fn to_region(self) -> Region {
        Region::from_bounds(self.left, self.top, self.right + 1, self.bottom + 1)
    }
}

impl From<&Region> for Bounds {
    fn from(region: &Region) -> Self {
        Self {
            left: region.x as i64,
            top: region.y as i64,
            right: region.right() as i64 - 1,
            bottom: region.bottom() as i64 - 1,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Request<'a> {
    Detect { image: &'a str, upsample: u32 },
    Landmarks { image: &'a str, region: Bounds },
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Debug, Default, Deserialize)]
struct Response {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    regions: Option<Vec<Bounds>>,
    #[serde(default)]
    landmarks: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    error: Option<String>,
}

fn protocol(message: impl Into<String>) -> AnalysisError {
    AnalysisError::SidecarProtocol(message.into())
}

/// Temporary grayscale PNG handed to the sidecar, removed on drop
struct TempImage(PathBuf);

impl TempImage {
    fn write(gray: &GrayImage) -> Result<Self, AnalysisError> {
        let name = format!(
            "face_sidecar_{}_{}.png",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let path = std::env::temp_dir().join(name);
        gray.save(&path)
            .map_err(|e| protocol(format!("failed to write temp image: {}", e)))?;
        Ok(Self(path))
    }

    fn path_str(&self) -> Result<&str, AnalysisError> {
        self.0
            .to_str()
            .ok_or_else(|| protocol("temp path is not valid UTF-8"))
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Kills the child without touching its pipes, so it works while a reader is blocked
#[derive(Clone)]
struct ChildKiller {
    child: Arc<Mutex<Child>>,
    terminated: Arc<AtomicBool>,
}

impl ChildKiller {
    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Kill and reap the child; a blocked read on its stdout then sees end of file
    fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = self.lock_child();
        if let Err(e) = child.kill() {
            debug!("Sidecar already exited: {}", e);
        }
        if let Err(e) = child.wait() {
            warn!("Failed to reap model sidecar: {}", e);
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        !self.is_terminated() && matches!(self.lock_child().try_wait(), Ok(None))
    }
}

/// A running sidecar process
pub struct SidecarProcess {
    killer: ChildKiller,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    next_id: u64,
}

impl SidecarProcess {
    pub fn spawn(command: &SidecarCommand) -> Result<Self, AnalysisError> {
        debug!("Spawning model sidecar: {} {:?}", command.program, command.args);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let killer = ChildKiller {
            child: Arc::new(Mutex::new(child)),
            terminated: Arc::new(AtomicBool::new(false)),
        };
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            killer.terminate();
            return Err(protocol("sidecar pipes unavailable"));
        };

        Ok(Self {
            killer,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
        })
    }

    /// Send one request and wait for its reply; transport failures kill the process
    fn request(&mut self, request: Request) -> Result<Response, AnalysisError> {
        if self.killer.is_terminated() {
            return Err(protocol("sidecar is no longer running"));
        }
        let id = self.next_id;
        self.next_id += 1;

        let response = match self.exchange(id, request) {
            Ok(response) => response,
            Err(e) => {
                warn!("Model sidecar failed on request {}: {}", id, e);
                self.killer.terminate();
                return Err(e);
            }
        };

        match response.error {
            Some(message) => Err(protocol(message)),
            None => Ok(response),
        }
    }

    fn exchange(&mut self, id: u64, request: Request) -> Result<Response, AnalysisError> {
        let line = serde_json::to_string(&Envelope { id, request })
            .map_err(|e| protocol(e.to_string()))?;
        writeln!(self.stdin, "{}", line)?;
        self.stdin.flush()?;

        loop {
            let mut reply = String::new();
            if self.stdout.read_line(&mut reply)? == 0 {
                return Err(protocol("sidecar closed its output"));
            }
            let reply = reply.trim();
            let Ok(response) = serde_json::from_str::<Response>(reply) else {
                debug!("Skipping non-protocol sidecar output: {}", reply);
                continue;
            };
            match response.id {
                Some(got) if got == id => return Ok(response),
                Some(got) if got < id => debug!("Discarding stale sidecar reply {}", got),
                Some(got) => {
                    return Err(protocol(format!(
                        "reply id {} does not match request {}",
                        got, id
                    )))
                }
                None => return Err(protocol(format!("reply without id: {}", reply))),
            }
        }
    }

    pub fn detect(
        &mut self,
        gray: &GrayImage,
        upsample: u32,
    ) -> Result<Vec<Region>, AnalysisError> {
        let temp = TempImage::write(gray)?;
        let response = self.request(Request::Detect {
            image: temp.path_str()?,
            upsample,
        })?;
        Ok(response
            .regions
            .unwrap_or_default()
            .into_iter()
            .map(Bounds::to_region)
            .collect())
    }

    pub fn predict(
        &mut self,
        gray: &GrayImage,
        region: &Region,
    ) -> Result<Option<LandmarkSet>, AnalysisError> {
        let temp = TempImage::write(gray)?;
        let response = self.request(Request::Landmarks {
            image: temp.path_str()?,
            region: Bounds::from(region),
        })?;
        match response.landmarks {
            None => Ok(None),
            Some(points) => {
                let points: Vec<(f64, f64)> = points.into_iter().map(|[x, y]| (x, y)).collect();
                LandmarkSet::from_float_points(&points).map(Some)
            }
        }
    }
}

impl Drop for SidecarProcess {
    fn drop(&mut self) {
        self.killer.terminate();
    }
}

/// Shared handle so one sidecar serves as both detector and predictor of an analyzer
#[derive(Clone)]
pub struct SidecarHandle {
    process: Arc<Mutex<SidecarProcess>>,
    killer: ChildKiller,
}

impl SidecarHandle {
    pub fn spawn(command: &SidecarCommand) -> Result<Self, AnalysisError> {
        let process = SidecarProcess::spawn(command)?;
        let killer = process.killer.clone();
        Ok(Self {
            process: Arc::new(Mutex::new(process)),
            killer,
        })
    }

    /// Kill the sidecar; safe to call while another thread waits on a reply
    pub fn terminate(&self) {
        self.killer.terminate();
    }

    pub fn is_running(&self) -> bool {
        self.killer.is_running()
    }

    fn with_process<T>(
        &self,
        f: impl FnOnce(&mut SidecarProcess) -> Result<T, AnalysisError>,
    ) -> Result<T> {
        let mut process = self
            .process
            .lock()
            .map_err(|_| anyhow!("model sidecar lock poisoned"))?;
        Ok(f(&mut process)?)
    }

    fn canceller(&self) -> CancelHandle {
        let killer = self.killer.clone();
        Arc::new(move || killer.terminate())
    }
}

impl FaceDetector for SidecarHandle {
    fn detect(&mut self, gray: &GrayImage, upsample: u32) -> Result<Vec<Region>> {
        self.with_process(|p| p.detect(gray, upsample))
    }

    fn is_usable(&self) -> bool {
        !self.killer.is_terminated()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(self.canceller())
    }
}

impl LandmarkPredictor for SidecarHandle {
    fn predict(&mut self, gray: &GrayImage, region: &Region) -> Result<Option<LandmarkSet>> {
        self.with_process(|p| p.predict(gray, region))
    }

    fn is_usable(&self) -> bool {
        !self.killer.is_terminated()
    }

    fn cancel_handle(&self) -> Option<CancelHandle> {
        Some(self.canceller())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    fn shell(script: &str) -> SidecarCommand {
        SidecarCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_parse_command() {
        let cmd = SidecarCommand::parse("python3  sidecar.py --model shape.dat").unwrap();
        assert_eq!(cmd.program, "python3");
        assert_eq!(cmd.args, vec!["sidecar.py", "--model", "shape.dat"]);
        assert!(SidecarCommand::parse("   ").is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let detect = serde_json::to_value(Envelope {
            id: 7,
            request: Request::Detect {
                image: "/tmp/a.png",
                upsample: 2,
            },
        })
        .unwrap();
        assert_eq!(detect["id"], 7);
        assert_eq!(detect["op"], "detect");
        assert_eq!(detect["upsample"], 2);

        let region = Region::new(5, 6, 10, 20);
        let landmarks = serde_json::to_value(Envelope {
            id: 8,
            request: Request::Landmarks {
                image: "/tmp/a.png",
                region: Bounds::from(&region),
            },
        })
        .unwrap();
        assert_eq!(landmarks["op"], "landmarks");
        assert_eq!(landmarks["region"]["right"], 14);
        assert_eq!(landmarks["region"]["bottom"], 25);
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let bounds = Bounds {
            left: 10,
            top: 10,
            right: 89,
            bottom: 89,
        };
        let region = bounds.to_region();
        assert_eq!(region, Region::new(10, 10, 80, 80));
        assert_eq!(region.area(), 6400);
        assert_eq!(Bounds::from(&region), bounds);
    }

    #[test]
    fn test_response_parsing() {
        let r: Response = serde_json::from_str(
            r#"{"id":3,"regions":[{"left":-4,"top":2,"right":40,"bottom":50}]}"#,
        )
        .unwrap();
        assert_eq!(r.id, Some(3));
        let regions = r.regions.unwrap();
        assert_eq!(regions[0].to_region(), Region::new(0, 2, 41, 49));

        let r: Response = serde_json::from_str(r#"{"id":1,"landmarks":null}"#).unwrap();
        assert!(r.landmarks.is_none());

        let r: Response = serde_json::from_str(r#"{"error":"model missing"}"#).unwrap();
        assert_eq!(r.error.as_deref(), Some("model missing"));
        assert!(r.id.is_none());
    }

    #[test]
    fn test_temp_image_is_removed() {
        let gray = GrayImage::new(4, 4);
        let path = {
            let temp = TempImage::write(&gray).unwrap();
            assert!(temp.0.exists());
            temp.0.clone()
        };
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_round_trip_with_shell_sidecar() {
        let mut handle = SidecarHandle::spawn(&shell(
            r##"while read line; do
                id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
                echo '{"id":'$id',"regions":[{"left":1,"top":2,"right":10,"bottom":21}]}'
            done"##,
        ))
        .unwrap();
        let gray = GrayImage::new(8, 8);
        let regions = handle.detect(&gray, 1).unwrap();
        assert_eq!(regions, vec![Region::new(1, 2, 10, 20)]);
        // no "landmarks" key means no shape
        assert!(handle.predict(&gray, &regions[0]).unwrap().is_none());
        assert!(FaceDetector::is_usable(&handle));
    }

    #[cfg(unix)]
    #[test]
    fn test_stray_output_does_not_shift_replies() {
        let mut handle = SidecarHandle::spawn(&shell(
            r##"echo 'warning: stray'
            n=0
            while read line; do
                n=$((n+1))
                id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
                echo "loading model..."
                echo '{"id":'$id',"regions":[{"left":'$n',"top":0,"right":19,"bottom":19}]}'
            done"##,
        ))
        .unwrap();
        let gray = GrayImage::new(4, 4);
        for n in 1..=3u32 {
            let regions = handle.detect(&gray, 0).unwrap();
            assert_eq!(regions[0].x, n);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_replies_are_discarded() {
        // every request is answered twice; the duplicate must not reach the next request
        let mut handle = SidecarHandle::spawn(&shell(
            r##"while read line; do
                id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
                echo '{"id":'$id',"regions":[{"left":'$id',"top":0,"right":39,"bottom":39}]}'
                echo '{"id":'$id',"regions":[]}'
            done"##,
        ))
        .unwrap();
        let gray = GrayImage::new(4, 4);
        for id in 1..=3u32 {
            let regions = handle.detect(&gray, 0).unwrap();
            assert_eq!(regions.len(), 1);
            assert_eq!(regions[0].x, id);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_mismatched_reply_kills_sidecar() {
        let script = r#"while read line; do echo '{"id":99,"regions":[]}'; done"#;
        let mut handle = SidecarHandle::spawn(&shell(script)).unwrap();
        let gray = GrayImage::new(2, 2);
        let err = handle.detect(&gray, 0).unwrap_err();
        assert!(err.to_string().contains("does not match"));
        assert!(!FaceDetector::is_usable(&handle));
        assert!(!handle.is_running());
        assert!(handle.detect(&gray, 0).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_sidecar_error_reply_keeps_process() {
        let mut handle = SidecarHandle::spawn(&shell(
            r##"while read line; do
                id=$(printf '%s' "$line" | sed 's/^{"id":\([0-9]*\).*/\1/')
                echo '{"id":'$id',"error":"predictor not loaded"}'
            done"##,
        ))
        .unwrap();
        let err = handle.detect(&GrayImage::new(2, 2), 0).unwrap_err();
        assert!(err.to_string().contains("predictor not loaded"));
        assert!(handle.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_sidecar_is_unusable() {
        let mut handle = SidecarHandle::spawn(&shell("read line; exit 0")).unwrap();
        assert!(handle.detect(&GrayImage::new(2, 2), 0).is_err());
        assert!(!LandmarkPredictor::is_usable(&handle));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancel_unblocks_hung_request() {
        let handle = SidecarHandle::spawn(&shell("read line; exec sleep 30")).unwrap();
        let mut worker = handle.clone();
        let started = Instant::now();
        let pending = thread::spawn(move || worker.detect(&GrayImage::new(2, 2), 0));

        thread::sleep(Duration::from_millis(200));
        let cancel = FaceDetector::cancel_handle(&handle).unwrap();
        cancel();

        assert!(pending.join().unwrap().is_err());
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!handle.is_running());
    }
}

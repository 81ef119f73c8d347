// crates/hge-harness-runner/src/docker.rs
// ============================================================================
// Module: Docker Helpers
// Description: Image conversion, log streaming and stop/remove of containers.
// Purpose: Share container plumbing between the Postgres and engine managers.
// Dependencies: testcontainers, tracing
// ============================================================================

//! ## Overview
//! Containers are started through the `testcontainers` blocking runner. A
//! collector thread per container follows stdout and stderr into a log file;
//! stopping joins the collectors before the container is removed.

use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use hge_harness_config::DockerImage;
use hge_harness_ledger::current_pid;
use testcontainers::Container;
use testcontainers::GenericImage;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Builds a generic image for `image`.
#[must_use]
pub fn generic_image(image: &DockerImage) -> GenericImage {
    GenericImage::new(image.name.clone(), image.tag.clone())
}

/// Returns a container name unique to this harness process and `port`.
#[must_use]
pub fn container_name(service: &str, port: u16) -> String {
    format!("hge-harness-{service}-{}-{port}", current_pid())
}

/// Follows both output streams of `container` into `log_file`.
///
/// # Errors
///
/// Returns an error when the log file cannot be created.
pub fn spawn_log_collectors(
    container: &Container<GenericImage>,
    log_file: &Path,
) -> io::Result<Vec<JoinHandle<()>>> {
    let sink = Arc::new(Mutex::new(File::create(log_file)?));
    let streams = [container.stdout(true), container.stderr(true)];
    Ok(streams
        .into_iter()
        .map(|stream| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || copy_lines(stream, &sink))
        })
        .collect())
}

/// Copies lines from `stream` into `sink` until the stream ends.
fn copy_lines(mut stream: Box<dyn BufRead + Send>, sink: &Mutex<File>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match stream.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) => {
                let Ok(mut file) = sink.lock() else {
                    return;
                };
                if file.write_all(&line).is_err() {
                    return;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return,
            Err(err) => {
                debug!(error = %err, "container log stream failed");
                return;
            }
        }
    }
}

/// Returns the stdout and stderr collected so far.
#[must_use]
pub fn collected_logs(container: &Container<GenericImage>) -> String {
    let mut logs = container.stdout_to_vec().unwrap_or_default();
    logs.extend(container.stderr_to_vec().unwrap_or_default());
    String::from_utf8_lossy(&logs).into_owned()
}

/// Stops `container`, joins its collectors and removes it.
pub fn stop_and_remove(name: &str, container: Container<GenericImage>, collectors: Vec<JoinHandle<()>>) {
    info!(container = name, "stopping container");
    if let Err(err) = container.stop() {
        warn!(container = name, error = %err, "failed to stop container");
    }
    for collector in collectors {
        if collector.join().is_err() {
            debug!(container = name, "log collector panicked");
        }
    }
    info!(container = name, "removing container");
    if let Err(err) = container.rm() {
        warn!(container = name, error = %err, "failed to remove container");
    }
}

#[cfg(test)]
mod tests {
    use hge_harness_config::DockerImage;

    use super::container_name;
    use super::generic_image;

    #[test]
    fn container_names_embed_pid_and_port() {
        let name = container_name("hge", 8081);
        assert!(name.starts_with("hge-harness-hge-"));
        assert!(name.ends_with("-8081"));
    }

    #[test]
    fn generic_image_keeps_name_and_tag() {
        use testcontainers::Image;

        let image = generic_image(&DockerImage {
            name: "hasura/graphql-engine".into(),
            tag: "v2.0.0".into(),
        });
        assert_eq!(image.name(), "hasura/graphql-engine");
        assert_eq!(image.tag(), "v2.0.0");
    }
}

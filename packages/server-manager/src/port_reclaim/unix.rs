use tokio::process::Command;

/// Kill whatever is listening on `port`. Returns true if at least one
/// process was signalled.
pub(crate) async fn kill_listener(port: u16) -> bool {
    let output = match Command::new("lsof")
        .arg("-t")
        .arg(format!("-iTCP:{port}"))
        .arg("-sTCP:LISTEN")
        .output()
        .await
    {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(port, error = %err, "lsof not available, cannot reclaim port");
            return false;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut killed = false;
    for line in stdout.lines() {
        let Ok(pid) = line.trim().parse::<i32>() else {
            continue;
        };
        tracing::info!(port, pid, "killing process holding server port");
        let result = unsafe { libc::kill(pid, libc::SIGKILL) };
        if result == 0 {
            killed = true;
        } else {
            tracing::warn!(port, pid, "failed to kill process on port");
        }
    }
    killed
}

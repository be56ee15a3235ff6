use tokio::process::Command;

/// Kill whatever is listening on `port`. Returns true if at least one
/// process was signalled.
pub(crate) async fn kill_listener(port: u16) -> bool {
    let output = match Command::new("netstat").arg("-ano").output().await {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(port, error = %err, "netstat not available, cannot reclaim port");
            return false;
        }
    };

    let needle = format!(":{port}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut killed = false;
    for line in stdout.lines() {
        if !line.contains("LISTENING") || !line.contains(&needle) {
            continue;
        }
        let Some(pid) = line.split_whitespace().last() else {
            continue;
        };
        if pid.parse::<u32>().is_err() {
            continue;
        }
        tracing::info!(port, pid, "killing process holding server port");
        match Command::new("taskkill")
            .args(["/F", "/PID", pid])
            .output()
            .await
        {
            Ok(output) if output.status.success() => killed = true,
            Ok(_) | Err(_) => {
                tracing::warn!(port, pid, "failed to kill process on port");
            }
        }
    }
    killed
}

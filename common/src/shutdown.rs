use owo_colors::OwoColorize;

/// Resolves once the process is asked to stop: SIGTERM from the kubelet
/// during pod shutdown, or SIGINT from a terminal. Controllers race this
/// against their leader-election loops and cancel in-flight work.
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        let which = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        eprintln!("{}", format!("🛑 {which} received, shutting down").red());
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
        eprintln!("{}", "🛑 Ctrl+C received, shutting down".red());
    }
}

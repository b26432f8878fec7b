#[tokio::main]
async fn main() {
    if let Err(e) = kanban_server::run().await {
        log::error!("kanban-server failed: {}", e);
        eprintln!("kanban-server failed: {}", e);
        std::process::exit(1);
    }
}

use axiom_bridge::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(err) = axiom_bridge::app(options).await {
        eprintln!("axiom-bridge: {:?}", err);
        std::process::exit(255);
    }
}

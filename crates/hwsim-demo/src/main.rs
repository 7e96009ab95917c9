use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use hwsim_core::events::DeviceEvent;
use hwsim_core::harness::TestClient;
use hwsim_core::{DeviceConfig, DeviceRegistry};
use hwsim_crypto::hd::DerivationPath;
use hwsim_crypto::Curve;
use hwsim_proto::v1::{EncodingV1, HashTypeV1, SchemaV1, SignRequestV1};

#[derive(Parser)]
#[command(name = "hwsim-demo")]
#[command(about = "Run a scripted SDK session against a simulated hardware wallet")]
struct Args {
    /// Device configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device id to create in the registry
    #[arg(short, long, default_value = "demo-wallet")]
    device_id: String,

    /// Require an explicit approval for signing, granted by the script
    #[arg(long)]
    manual_approval: bool,

    /// Message to sign
    #[arg(short, long, default_value = "hello from hwsim")]
    message: String,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "hwsim_demo={},hwsim_core={},hwsim_crypto={}",
            args.log_level, args.log_level, args.log_level
        ))
        .init();

    let mut config = match &args.config {
        Some(path) => DeviceConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DeviceConfig::load_from_env(),
    };
    if args.manual_approval {
        config.auto_approve = false;
    }
    let registry = DeviceRegistry::new(config).context("invalid device configuration")?;

    let (approvals_tx, mut approvals) = mpsc::unbounded_channel();
    let subscription = registry.subscribe(&args.device_id, move |event| {
        if let Ok(json) = serde_json::to_string(event) {
            info!(event = %json, "device event");
        }
        if let DeviceEvent::ApprovalRequested { request_id, .. } = event {
            let _ = approvals_tx.send(*request_id);
        }
    });

    let device = registry.device(&args.device_id);
    let heartbeat = device.spawn_heartbeat(Duration::from_secs(5));
    let mut client = TestClient::new(device.clone()).with_app_name("hwsim-demo");

    // Connect and pair
    let connect = client.connect().await.context("connect")?;
    println!("FIRMWARE={:?}", connect.firmware_version);
    println!("EPHEMERAL_PUB={}", hex::encode(&connect.ephemeral_pub));
    let code = device.enter_pairing_mode().await.context("enter pairing mode")?;
    println!("PAIRING_CODE={code}");
    let paired = client.pair(&code).await.context("finalize pairing")?;
    println!("WALLETS={}", paired.wallets.len());

    // Addresses
    let eth = client.get_addresses("m/44'/60'/0'/0/0", 3, 0).await.context("ethereum addresses")?;
    for entry in &eth.entries {
        println!("ETH {} {}", DerivationPath::new(entry.path.clone()), entry.address);
    }
    let sol = client.get_addresses("m/44'/501'/0'/0'", 1, 0).await.context("solana addresses")?;
    for entry in &sol.entries {
        println!("SOL {} {}", DerivationPath::new(entry.path.clone()), entry.address);
    }

    // Sign
    let request = SignRequestV1 {
        data: args.message.as_bytes().to_vec(),
        path: eth.entries[0].path.clone(),
        schema: SchemaV1::EthPersonal as i32,
        curve: Curve::Secp256k1.id(),
        encoding: EncodingV1::Utf8 as i32,
        hash_type: HashTypeV1::Keccak256 as i32,
    };
    let client = Arc::new(client);
    let signer = Arc::clone(&client);
    let signing = tokio::spawn(async move { signer.sign(&request).await });
    if args.manual_approval {
        let id = approvals.recv().await.context("approval request never arrived")?;
        println!("APPROVING_REQUEST={id}");
        device.approve_request(id)?;
    }
    let signed = signing.await??;
    println!("DIGEST={}", hex::encode(&signed.digest));
    println!("SIGNATURE={}", hex::encode(&signed.signature));
    println!("RECOVERY_ID={:?}", signed.recovery_id);

    // KV records
    let stored = client
        .add_kv_records(0, &[("vitalik.eth", "0xd8dA6BF26964aF9D7eEd9e03E53415D37aA96045"), ("label", "demo")])
        .await
        .context("add kv records")?;
    let page = client.get_kv_records(0, 0, 10).await.context("get kv records")?;
    println!("KV_STORED={stored} KV_TOTAL={}", page.total);
    for record in &page.records {
        println!("KV {} {}={}", record.id, record.key, record.value);
    }

    let status = device.status().await;
    println!("STATUS={}", serde_json::to_string_pretty(&status)?);

    heartbeat.abort();
    subscription.unsubscribe();
    registry.dispose(&args.device_id).await;
    info!("demo finished");
    Ok(())
}

//! End-to-end flow against fake external tools: a stub `uhubctl` on PATH
//! and a stub port enumerator, driving scan, cache persistence, eviction,
//! resolution, and the lock lifecycle.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use usb_device::cache::{Link, LocationCache};
use usb_device::config::Config;
use usb_device::locks::{CheckoutOptions, LockManager};
use usb_device::registry::Registry;
use usb_device::resolver;
use usb_device::scanner::{self, ScanStatus};

const MAC_A: &str = "AA:AA:AA:AA:AA:AA";
const MAC_B: &str = "BB:BB:BB:BB:BB:BB";

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn write_uhubctl(bin_dir: &Path, port1_descriptor: &str) {
    write_executable(
        &bin_dir.join("uhubctl"),
        &format!(
            "#!/bin/sh\n\
             cat <<'EOF'\n\
             Current status for hub 20-2 [05e3:0610 USB2.0 Hub, USB 2.10, 4 ports, ppps]\n  \
             Port 1: 0503 power highspeed enable connect [{port1_descriptor}]\n  \
             Port 2: 0100 power\n  \
             Port 3: 0100 power\n  \
             Port 4: 0100 power\n\
             EOF\n"
        ),
    );
}

fn write_port_enum(path: &Path, lines: &str) {
    // Stands in for the python/pyserial interpreter; ignores `-c <script>`.
    write_executable(path, &format!("#!/bin/sh\ncat <<'EOF'\n{lines}\nEOF\n"));
}

fn config_for(dir: &Path, python: PathBuf) -> Config {
    Config {
        conf_path: dir.join("devices.conf"),
        db_path: dir.join("locations.json"),
        lock_dir: dir.join("locks"),
        python: python.display().to_string(),
        install_dir: dir.to_path_buf(),
        bin_path: dir.join("usb-device"),
    }
}

#[tokio::test]
async fn scan_resolve_evict_and_lock_flow() {
    let dir = tempfile::tempdir().unwrap();
    let bin_dir = dir.path().join("bin");
    fs::create_dir_all(&bin_dir).unwrap();

    // Put the stub uhubctl ahead of everything else.
    let old_path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH", format!("{}:{old_path}", bin_dir.display()));

    fs::write(
        dir.path().join("devices.conf"),
        format!(
            "Device A={MAC_A}\n\
             \n\
             [Board X]\n\
             mac={MAC_B}\n\
             type=esp32\n\
             chip=esp32s3\n\
             \n\
             [Charger A]\n\
             location=20-2.3\n\
             type=power\n"
        ),
    )
    .unwrap();

    let enumerator = bin_dir.join("fake-python");
    write_uhubctl(&bin_dir, &format!("Espressif USB JTAG/serial debug unit {MAC_A}"));
    write_port_enum(
        &enumerator,
        &format!("{MAC_A}|/dev/ttyACM0|20-2.1\n{MAC_B}|/dev/ttyACM1|20-9.1"),
    );

    let config = config_for(dir.path(), enumerator.clone());
    let registry = Registry::load(&config.conf_path).unwrap();

    // First scan: A direct on the hub, B visible but ungoverned, charger
    // static.
    let outcome = scanner::run(&config, &registry).await.unwrap();
    assert_eq!(outcome.found_count(), 2);
    assert!(outcome.evicted.is_empty());
    assert!(matches!(
        &outcome.results[2].status,
        ScanStatus::Static { hub, port } if hub == "20-2" && port == "3"
    ));

    let cache = LocationCache::load(&config.db_path).unwrap();
    let rec_a = cache.get("Device A").unwrap();
    assert_eq!((rec_a.hub.as_str(), rec_a.port.as_str()), ("20-2", "1"));
    assert_eq!(rec_a.link, Link::Direct);
    assert_eq!(cache.get("Board X").unwrap().link, Link::NoHub);

    // Resolution without a live pass reports the cache, tagged as such.
    let resolved = resolver::resolve("device a", &registry, &cache, false, &config.python)
        .await
        .unwrap();
    assert_eq!(resolved.hub(), "20-2");
    assert_eq!(resolved.topology.unwrap().link, Link::Cached);

    // Static resolution never touches the cache.
    let charger = resolver::resolve("charger", &registry, &cache, false, &config.python)
        .await
        .unwrap();
    let topo = charger.topology.unwrap();
    assert_eq!(topo.link, Link::Static);
    assert_eq!((topo.hub.as_str(), topo.port.as_str()), ("20-2", "3"));
    assert!(charger.device.serial().is_none());

    // The hardware moves: Board X takes port 1, Device A vanishes.
    write_uhubctl(&bin_dir, &format!("Espressif USB JTAG/serial debug unit {MAC_B}"));
    write_port_enum(&enumerator, &format!("{MAC_B}|/dev/ttyACM1|20-2.1"));

    let outcome = scanner::run(&config, &registry).await.unwrap();
    assert_eq!(outcome.evicted, vec!["Device A".to_string()]);

    let cache = LocationCache::load(&config.db_path).unwrap();
    assert!(cache.get("Device A").is_none());
    let rec_b = cache.get("Board X").unwrap();
    assert_eq!((rec_b.hub.as_str(), rec_b.port.as_str()), ("20-2", "1"));
    assert_eq!(rec_b.link, Link::Direct);

    // Lock lifecycle on the registered name.
    let locks = LockManager::new(&config.lock_dir);
    locks
        .checkout("Board X", &CheckoutOptions::default())
        .await
        .unwrap();
    assert!(locks.holder("Board X").is_some());

    let entries = locks.list().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].slug, "board_x");
    assert!(!entries[0].stale);

    locks.checkin("Board X", false).unwrap();
    assert!(locks.holder("Board X").is_none());
    assert!(locks.list().unwrap().is_empty());
}

//! Environment readiness check.

use anyhow::Result;

use crate::config::SiteProfile;
use crate::session::find_chromium;

/// Check Chromium availability and marketplace reachability.
pub async fn run() -> Result<()> {
    println!("Bazaar Doctor");
    println!("=============");
    println!();

    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    println!("OS:   {os}");
    println!("Arch: {arch}");
    println!();

    let chromium_path = find_chromium();
    match &chromium_path {
        Some(path) => println!("[OK] Chromium found: {}", path.display()),
        None => println!(
            "[!!] Chromium NOT found. Install Chrome for Testing under ~/.bazaar/chromium or set BAZAAR_CHROMIUM_PATH."
        ),
    }

    let site = SiteProfile::default();
    let reachable = match reqwest::Client::builder()
        .user_agent(site.user_agent.clone())
        .timeout(std::time::Duration::from_secs(10))
        .build()
    {
        Ok(client) => match client.get(&site.base_url).send().await {
            Ok(resp) => {
                println!("[OK] {} reachable (status {})", site.base_url, resp.status());
                true
            }
            Err(e) => {
                println!("[!!] {} NOT reachable: {e}", site.base_url);
                false
            }
        },
        Err(e) => {
            println!("[!!] Could not build HTTP client: {e}");
            false
        }
    };

    println!();
    if chromium_path.is_some() && reachable {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}

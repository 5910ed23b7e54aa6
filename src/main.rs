//! WP Veiculos Desktop - Main Entry Point
//!
//! Desktop client for the WP Veiculos vehicle marketplace.

#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use anyhow::Context;
use tauri::Manager;
use tracing::info;

use wp_veiculos_lib::{auth::Subscription, commands, config::AppConfig, logging, AppState};

/// Keeps the `auth_changed` forwarder registered for the app lifetime
struct AuthEvents(#[allow(dead_code)] Subscription);

fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Failed to load configuration")?;
    logging::init(&config.log_dir());
    info!("WP Veiculos Desktop starting...");

    let app_state = AppState::from_config(&config).context("Failed to initialize application")?;
    tauri::async_runtime::block_on(app_state.start());

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_shell::init())
        .manage(app_state)
        .invoke_handler(tauri::generate_handler![
            commands::get_auth_state,
            commands::sign_in,
            commands::register,
            commands::sign_out,
            commands::resolve_route,
            commands::list_listings,
            commands::get_listing,
            commands::list_my_listings,
            commands::delete_listing,
            commands::upload_image,
            commands::remove_image,
            commands::pending_images,
            commands::submit_listing,
            commands::resume_submission,
            commands::open_whatsapp,
        ])
        .setup(|app| {
            let forwarder = {
                let state = app.state::<AppState>();
                commands::forward_auth_events(app.handle().clone(), &state)
            };
            app.manage(AuthEvents(forwarder));

            info!("Application setup complete");
            Ok(())
        })
        .build(tauri::generate_context!())
        .context("Failed to build WP Veiculos")?;

    app.run(|handle, event| {
        if let tauri::RunEvent::Exit = event {
            handle.state::<AppState>().shutdown();
        }
    });

    Ok(())
}

//! Print DAMAGE notifications for the root window of `$DISPLAY`.
//!
//! ```text
//! RUST_LOG=xwire=debug cargo run --example damage_watch
//! ```

use tracing::Level;
use tracing_subscriber::EnvFilter;
use xwire::event::Event;
use xwire::ext::damage::{Damage, NotifyEvent, ReportLevel, MAJOR_VERSION, MINOR_VERSION};
use xwire::Connection;

#[tokio::main]
async fn main() -> xwire::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::TRACE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let conn = Connection::builder().extension::<Damage>().connect().await?;
    let damage = Damage::new(&conn)?;

    let version = damage
        .query_version(MAJOR_VERSION, MINOR_VERSION)
        .await?
        .reply()
        .await?;
    println!(
        "{} speaks DAMAGE {}.{}",
        conn.setup().vendor,
        version.major_version,
        version.minor_version
    );

    let Some(screen) = conn.setup().roots.first() else {
        eprintln!("server reported no screens");
        return Ok(());
    };
    let id = conn.generate_id().await?;
    damage
        .create(id, screen.root, ReportLevel::BoundingBox)
        .await?
        .check()
        .await?;

    loop {
        match conn.wait_for_event().await? {
            event @ Event::Extension(_) => {
                if let Some(notify) = event.downcast_ref::<NotifyEvent>() {
                    let area = notify.area;
                    println!(
                        "damage on {:#x}: {}x{}+{}+{}",
                        notify.drawable, area.width, area.height, area.x, area.y
                    );
                    damage.subtract_unchecked(id, 0, 0).await?;
                }
            }
            Event::Unknown(raw) => println!("event {}", raw.code()),
            Event::Malformed { raw, error } => {
                eprintln!("event {} did not decode: {}", raw.code(), error)
            }
        }
    }
}

//! GatherPress data repair steps, 0.29.0 through 0.33.0.
//!
//! [`gatherpress_registry`] builds the registry the CLI and gateway run.

pub mod batch;
pub mod content;
pub mod datetime;
pub mod geocode;
pub mod remap;
pub mod rsvp;
pub mod timezone;

use std::sync::Arc;

use driftfix_db::SiteStore;
use driftfix_migrate::{MigrationError, Registry, SchemaVersion};

pub use batch::{BatchProgress, BatchStep};
pub use content::{BlockExpansion, ClassRename};
pub use datetime::EventDatetimeBackfill;
pub use geocode::{Coordinates, DisabledGeocoder, Geocoder, NominatimGeocoder, VenueCoordinatesBackfill};
pub use remap::{RemapOp, RemapStep};
pub use rsvp::MoveRsvpsToComments;
pub use timezone::SiteTimezone;

pub const V0_29_0: SchemaVersion = SchemaVersion::new(0, 29, 0);
pub const V0_30_0: SchemaVersion = SchemaVersion::new(0, 30, 0);
pub const V0_31_0: SchemaVersion = SchemaVersion::new(0, 31, 0);
pub const V0_32_0: SchemaVersion = SchemaVersion::new(0, 32, 0);
pub const V0_33_0: SchemaVersion = SchemaVersion::new(0, 33, 0);

/// What the concrete steps need from the outside.
#[derive(Clone)]
pub struct StepContext {
    pub batch_size: usize,
    pub geocoder: Arc<dyn Geocoder>,
}

impl Default for StepContext {
    fn default() -> Self {
        Self {
            batch_size: 100,
            geocoder: Arc::new(DisabledGeocoder),
        }
    }
}

fn gp_prefix_remap() -> RemapStep {
    let mut ops = vec![
        RemapOp::Table { from: "gp_events", to: "gatherpress_events" },
        RemapOp::Table { from: "gp_rsvps", to: "gatherpress_rsvps" },
        RemapOp::PostType { from: "gp_event", to: "gatherpress_event" },
        RemapOp::PostType { from: "gp_venue", to: "gatherpress_venue" },
    ];
    ops.extend(
        [
            ("max_guest_limit", "gatherpress_max_guest_limit"),
            ("enable_anonymous_rsvp", "gatherpress_enable_anonymous_rsvp"),
            ("enable_initial_decline", "gatherpress_enable_initial_decline"),
            ("online_event_link", "gatherpress_online_event_link"),
            ("venue_information", "gatherpress_venue_information"),
        ]
        .map(|(from, to)| RemapOp::PostMetaKey { from, to }),
    );
    ops.extend([
        RemapOp::Taxonomy { from: "gp_topic", to: "gatherpress_topic" },
        RemapOp::Taxonomy { from: "_gp_venue", to: "_gatherpress_venue" },
    ]);
    ops.extend(
        [
            ("gp_date_format", "gatherpress_date_format"),
            ("gp_event_updates_opt_in", "gatherpress_event_updates_opt_in"),
            ("gp_time_format", "gatherpress_time_format"),
            ("gp_timezone", "gatherpress_timezone"),
        ]
        .map(|(from, to)| RemapOp::UserMetaKey { from, to }),
    );
    ops.push(RemapOp::OptionPrefix { from: "gp_", to: "gatherpress_" });

    RemapStep::new("rename-gp-prefix", V0_29_0, ops)
}

/// Every GatherPress repair step, in registration order.
pub fn gatherpress_registry(ctx: &StepContext) -> Result<Registry<SiteStore>, MigrationError> {
    let mut registry = Registry::new();

    registry.register(gp_prefix_remap())?;
    registry.register(MoveRsvpsToComments::new(V0_30_0))?;
    registry.register(VenueCoordinatesBackfill::new(
        V0_30_0,
        ctx.geocoder.clone(),
        ctx.batch_size,
    ))?;
    registry.register(RemapStep::new(
        "rename-site-notification-option",
        V0_30_0,
        vec![RemapOp::Option {
            from: "gatherpress_suppress_membership_notification",
            to: "gatherpress_suppress_site_notification",
        }],
    ))?;
    registry.register(EventDatetimeBackfill::new(V0_31_0, ctx.batch_size))?;
    registry.register(BlockExpansion::rsvp(V0_32_0, ctx.batch_size))?;
    registry.register(BlockExpansion::add_to_calendar(V0_33_0, ctx.batch_size))?;
    registry.register(ClassRename::new(V0_33_0, ctx.batch_size))?;
    registry.register(RemapStep::new(
        "drop-site-notification-option",
        V0_33_0,
        vec![RemapOp::DeleteOption("gatherpress_suppress_site_notification")],
    ))?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_orders_steps_by_version_then_registration() {
        let registry = gatherpress_registry(&StepContext::default()).unwrap();
        let names: Vec<_> = registry.steps().map(|s| s.name().to_string()).collect();
        assert_eq!(
            names,
            [
                "rename-gp-prefix",
                "move-rsvps-to-comments",
                "backfill-venue-coordinates",
                "rename-site-notification-option",
                "backfill-event-datetime",
                "expand-rsvp-blocks",
                "expand-add-to-calendar-block",
                "rename-css-classes",
                "drop-site-notification-option",
            ]
        );
        assert_eq!(registry.latest_version(), Some(V0_33_0));
    }

    #[test]
    fn pending_from_0_31_0_starts_at_the_rsvp_blocks() {
        let registry = gatherpress_registry(&StepContext::default()).unwrap();
        let pending: Vec<_> = registry.pending(&V0_31_0).map(|s| s.name().to_string()).collect();
        assert_eq!(pending.first().map(String::as_str), Some("expand-rsvp-blocks"));
        assert_eq!(pending.len(), 4);
    }
}

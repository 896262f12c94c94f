//! Ready-made schemas.

use crate::{CollectionDef, DocumentSchema, EntitySchema};

/// Root class of the customer order document.
pub const CUSTOMER_ORDER: &str = "CustomerOrder";

/// Schema of a customer order: stops and the transport orders between them,
/// rows of several kinds, goods with nested packages, documents, notes and
/// schedule entries for order templates.
///
/// Deviation rows are left out of dry runs. Their type and cause are
/// required, so a half-filled row would fail every recalculation.
pub fn customer_order_schema() -> DocumentSchema {
    let owned = |name: &str, class: &str| CollectionDef::new(name, class).with_inverse("order");

    DocumentSchema::new(
        EntitySchema::new(CUSTOMER_ORDER, "orders")
            .scalars([
                "waybill",
                "customer_reference",
                "sender_reference",
                "recipient_reference",
                "planned_pickup_at",
                "planned_delivery_at",
                "phase",
                "is_template",
                "template_name",
            ])
            .references([
                "customer",
                "contact",
                "agreement",
                "project",
                "operation",
                "service",
                "cargoType",
            ])
            .dependents("customer", ["contact", "agreement", "project"])
            .collection(owned("stops", "Stop"))
            .collection(owned("transportOrders", "TransportOrder"))
            .collection(owned("specificationRows", "SpecificationRow"))
            .collection(owned("debitRows", "DebitRow"))
            .collection(owned("goodsRows", "GoodsRow"))
            .collection(owned("dangerousGoodsRows", "DangerousGoodsRow"))
            .collection(owned("documents", "DocumentModel"))
            .collection(owned("deviationRows", "DeviationRow"))
            .collection(owned("notes", "OrderNote"))
            .collection(owned("goodsTotalOverride", "GoodsTotalOverride"))
            .collection(CollectionDef::new("schedules", "ScheduleEntry")),
    )
    .with_entity(
        EntitySchema::new("Stop", "stops")
            .scalars([
                "order_by",
                "name",
                "street_name",
                "street_number",
                "postal_code",
                "city",
                "country",
                "latitude",
                "longitude",
            ])
            .references(["destination"]),
    )
    .with_entity(
        EntitySchema::new("TransportOrder", "transportOrders")
            .scalars([
                "order_by",
                "driver_instructions",
                "pickup_earliest_at",
                "pickup_latest_at",
                "delivery_earliest_at",
                "delivery_latest_at",
                "auto_dispatch",
            ])
            .references(["pickup", "delivery", "unit", "line"]),
    )
    .with_entity(
        EntitySchema::new("SpecificationRow", "specificationRows")
            .scalars(["order_by", "started_at", "ended_at", "quantity", "hours", "notes"])
            .references(["activity", "startPointDestination", "endPointDestination"]),
    )
    .with_entity(
        EntitySchema::new("DebitRow", "debitRows")
            .scalars([
                "order_by",
                "debit_row_type",
                "specification",
                "quantity",
                "price",
                "discount",
                "total_price",
                "commission",
            ])
            // `payee` is polymorphic: its kind names the payee's resource type.
            .references(["transportOrder", "article", "quantityUnit", "payee"]),
    )
    .with_entity(
        EntitySchema::new("GoodsRow", "goodsRows")
            .scalars([
                "order_by",
                "specification",
                "quantity",
                "weight",
                "volume",
                "loading_metres",
                "pallet_places",
                "length",
                "width",
                "height",
            ])
            .references(["goodsRowQuantityType"])
            .collection(CollectionDef::new("packages", "Package").with_inverse("goodsRow")),
    )
    .with_entity(EntitySchema::new("Package", "packages").scalars(["order_by", "number"]))
    .with_entity(
        EntitySchema::new("DangerousGoodsRow", "dangerousGoodsRows")
            .scalars([
                "order_by",
                "adr_class",
                "specification",
                "quantity",
                "substance_amount",
            ])
            .references(["goodsRow", "unitedNationsNumber", "wasteCode"]),
    )
    .with_entity(
        EntitySchema::new("DocumentModel", "documents")
            .scalars(["order_by", "name", "attach_to_invoice"])
            .references(["documentType", "file"]),
    )
    .with_entity(
        EntitySchema::new("DeviationRow", "deviationRows")
            .scalars(["order_by", "status", "description"])
            .references(["deviationType", "deviationCause", "transportOrder"]),
    )
    .with_entity(
        EntitySchema::new("OrderNote", "orderNotes").scalars(["note_type", "notes"]),
    )
    .with_entity(
        EntitySchema::new("GoodsTotalOverride", "goodsTotalOverrides")
            .scalars(["volume", "loading_metres", "pallet_places"]),
    )
    .with_deferred(
        EntitySchema::new("ScheduleEntry", "schedules").scalars([
            "name",
            "minute",
            "hour",
            "month",
            "day_of_week",
            "day_of_month",
            "active_from",
            "active_till",
        ]),
        Some("is_template"),
    )
    .excluding_from_dry_runs("DeviationRow")
}

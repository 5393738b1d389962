//! Listing lifecycle: Available -> Reserved -> Sold, with Reserved able to
//! fall back to Available. Guards are evaluated here as a pure function so
//! every caller (HTTP handlers, tests) shares one transition table; the
//! repository applies the result conditionally on the status the guard saw.

use crate::models::{Id, Listing, ListingStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Reserve,
    CancelReservation,
    Relist,
    MarkSold,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Reserve => "reserve",
            LifecycleAction::CancelReservation => "cancel_reservation",
            LifecycleAction::Relist => "relist",
            LifecycleAction::MarkSold => "mark_sold",
        }
    }
}

/// The state change a permitted action produces, plus the user-facing
/// confirmation. `expect` is the status the guards ran against; the store
/// only commits if the row still holds it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub expect: ListingStatus,
    pub status: ListingStatus,
    pub reserved_by: Option<Id>,
    pub message: &'static str,
}

/// Guard failure. Not an error in the HTTP sense: handlers turn this into a
/// rejection message and leave the listing untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denied {
    #[error("This listing is not available for reservation.")]
    NotAvailable,
    #[error("You cannot reserve your own listing.")]
    OwnListing,
    #[error("This listing is not reserved.")]
    NotReserved,
    #[error("You do not have permission to cancel this reservation.")]
    NotParticipant,
    #[error("Only the seller can relist.")]
    RelistNotSeller,
    #[error("Only the seller can mark as sold.")]
    MarkSoldNotSeller,
    #[error("Listing must be reserved before marking as sold.")]
    NotYetReserved,
}

/// Evaluate `action` by `actor` against the listing's current state.
///
/// Guard order is observable through the returned message: reserve checks
/// availability before the self-reserve rule, cancel checks reservation
/// state before permission, mark_sold checks the seller before the state.
pub fn apply(listing: &Listing, actor: Id, action: LifecycleAction) -> Result<Transition, Denied> {
    match action {
        LifecycleAction::Reserve => {
            if listing.status != ListingStatus::Available {
                return Err(Denied::NotAvailable);
            }
            if listing.seller_id == actor {
                return Err(Denied::OwnListing);
            }
            Ok(Transition {
                expect: ListingStatus::Available,
                status: ListingStatus::Reserved,
                reserved_by: Some(actor),
                message: "You have reserved this listing.",
            })
        }
        LifecycleAction::CancelReservation => {
            if listing.status != ListingStatus::Reserved {
                return Err(Denied::NotReserved);
            }
            if listing.reserved_by_id != Some(actor) && listing.seller_id != actor {
                return Err(Denied::NotParticipant);
            }
            Ok(Transition {
                expect: ListingStatus::Reserved,
                status: ListingStatus::Available,
                reserved_by: None,
                message: "Reservation cancelled.",
            })
        }
        LifecycleAction::Relist => {
            // Seller-only, valid from any status.
            if listing.seller_id != actor {
                return Err(Denied::RelistNotSeller);
            }
            Ok(Transition {
                expect: listing.status,
                status: ListingStatus::Available,
                reserved_by: None,
                message: "Listing relisted as available.",
            })
        }
        LifecycleAction::MarkSold => {
            if listing.seller_id != actor {
                return Err(Denied::MarkSoldNotSeller);
            }
            if listing.status != ListingStatus::Reserved {
                return Err(Denied::NotYetReserved);
            }
            Ok(Transition {
                expect: ListingStatus::Reserved,
                // reserved_by is kept: it records the buyer.
                status: ListingStatus::Sold,
                reserved_by: listing.reserved_by_id,
                message: "Listing marked as sold.",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const SELLER: Id = 1;
    const BUYER: Id = 2;
    const STRANGER: Id = 3;

    fn listing(status: ListingStatus, reserved_by: Option<Id>) -> Listing {
        Listing {
            id: 10,
            title: "Bike".into(),
            description: "Old but solid".into(),
            price: 40.0,
            location: "Malmo".into(),
            category: "Sports".into(),
            status,
            seller_id: SELLER,
            reserved_by_id: reserved_by,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reserve_from_available() {
        let l = listing(ListingStatus::Available, None);
        let t = apply(&l, BUYER, LifecycleAction::Reserve).unwrap();
        assert_eq!(t.status, ListingStatus::Reserved);
        assert_eq!(t.reserved_by, Some(BUYER));
        assert_eq!(t.expect, ListingStatus::Available);
    }

    #[test]
    fn seller_cannot_reserve_own_listing() {
        let l = listing(ListingStatus::Available, None);
        assert_eq!(
            apply(&l, SELLER, LifecycleAction::Reserve),
            Err(Denied::OwnListing)
        );
    }

    #[test]
    fn reserve_requires_available() {
        for status in [ListingStatus::Reserved, ListingStatus::Sold] {
            let l = listing(status, Some(BUYER));
            assert_eq!(
                apply(&l, STRANGER, LifecycleAction::Reserve),
                Err(Denied::NotAvailable)
            );
        }
    }

    #[test]
    fn availability_is_checked_before_self_reserve() {
        // A seller poking at their own reserved listing gets the status
        // message, not the ownership one.
        let l = listing(ListingStatus::Reserved, Some(BUYER));
        assert_eq!(
            apply(&l, SELLER, LifecycleAction::Reserve),
            Err(Denied::NotAvailable)
        );
    }

    #[test]
    fn cancel_by_buyer_and_by_seller() {
        let l = listing(ListingStatus::Reserved, Some(BUYER));
        for actor in [BUYER, SELLER] {
            let t = apply(&l, actor, LifecycleAction::CancelReservation).unwrap();
            assert_eq!(t.status, ListingStatus::Available);
            assert_eq!(t.reserved_by, None);
        }
    }

    #[test]
    fn cancel_denied_for_third_party() {
        let l = listing(ListingStatus::Reserved, Some(BUYER));
        assert_eq!(
            apply(&l, STRANGER, LifecycleAction::CancelReservation),
            Err(Denied::NotParticipant)
        );
    }

    #[test]
    fn cancel_requires_reserved() {
        for status in [ListingStatus::Available, ListingStatus::Sold] {
            let reserved_by = (status == ListingStatus::Sold).then_some(BUYER);
            let l = listing(status, reserved_by);
            assert_eq!(
                apply(&l, SELLER, LifecycleAction::CancelReservation),
                Err(Denied::NotReserved)
            );
        }
    }

    #[test]
    fn relist_is_seller_only_from_any_status() {
        for (status, reserved_by) in [
            (ListingStatus::Available, None),
            (ListingStatus::Reserved, Some(BUYER)),
            (ListingStatus::Sold, Some(BUYER)),
        ] {
            let l = listing(status, reserved_by);
            let t = apply(&l, SELLER, LifecycleAction::Relist).unwrap();
            assert_eq!(t.status, ListingStatus::Available);
            assert_eq!(t.reserved_by, None);
            assert_eq!(t.expect, status);

            assert_eq!(
                apply(&l, BUYER, LifecycleAction::Relist),
                Err(Denied::RelistNotSeller)
            );
        }
    }

    #[test]
    fn mark_sold_keeps_the_buyer() {
        let l = listing(ListingStatus::Reserved, Some(BUYER));
        let t = apply(&l, SELLER, LifecycleAction::MarkSold).unwrap();
        assert_eq!(t.status, ListingStatus::Sold);
        assert_eq!(t.reserved_by, Some(BUYER));
    }

    #[test]
    fn mark_sold_checks_seller_before_state() {
        let l = listing(ListingStatus::Available, None);
        assert_eq!(
            apply(&l, BUYER, LifecycleAction::MarkSold),
            Err(Denied::MarkSoldNotSeller)
        );
        assert_eq!(
            apply(&l, SELLER, LifecycleAction::MarkSold),
            Err(Denied::NotYetReserved)
        );
    }

    #[test]
    fn no_transition_out_of_sold_except_relist() {
        let l = listing(ListingStatus::Sold, Some(BUYER));
        assert!(apply(&l, BUYER, LifecycleAction::Reserve).is_err());
        assert!(apply(&l, SELLER, LifecycleAction::MarkSold).is_err());
        assert!(apply(&l, BUYER, LifecycleAction::CancelReservation).is_err());
        assert!(apply(&l, SELLER, LifecycleAction::Relist).is_ok());
    }
}

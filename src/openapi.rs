use crate::models::{
    Listing, ListingImage, ListingStatus, Message, NewListing, Report, Review, UpdateListing,
    UserPublic,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::register,
        crate::routes::login,
        crate::routes::list_listings,
        crate::routes::listing_detail,
        crate::routes::reserve_listing,
        crate::routes::cancel_reservation,
        crate::routes::relist_listing,
        crate::routes::mark_sold,
        crate::routes::user_profile,
        crate::routes::conversation_thread,
        crate::routes::favorite_listing,
        crate::routes::unfavorite_listing,
        crate::routes::submit_review,
    ),
    components(schemas(
        Listing, ListingStatus, NewListing, UpdateListing, ListingImage,
        Message, Review, Report, UserPublic,
        crate::routes::Credentials, crate::routes::ListingDetail,
        crate::routes::UserProfile, crate::routes::ConversationThread,
        crate::routes::MessageForm, crate::routes::ReviewForm, crate::routes::ReportForm
    )),
    tags(
        (name = "listings", description = "Listing search, CRUD and lifecycle"),
        (name = "messaging", description = "Conversations and direct messages"),
        (name = "reviews", description = "Post-sale ratings"),
    )
)]
pub struct ApiDoc;

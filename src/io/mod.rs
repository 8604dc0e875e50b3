//! External collaborator boundaries: the imagery catalog and the raster
//! asset provider

pub mod assets;
pub mod catalog;

pub use assets::{fetch_bands, AssetFetcher, FetchPolicy};
pub use catalog::{
    run_search, CatalogClient, CatalogPage, HttpCatalogClient, PagingPolicy, SearchOutcome,
};

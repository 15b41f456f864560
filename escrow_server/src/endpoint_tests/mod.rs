mod escrow;
mod helpers;
mod orders;
mod webhooks;

mod account;
mod settlement;

mod batch;
mod invalidation;
mod single;
